use anyhow::{Context, Result};
use gridmate::protocol::{Response, auth2_hash};
use rand::Rng;
use std::path::Path;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

const RPC_AUTH_FILE: &str = "rpc_auth.cfg";

/// Read the management RPC password, generating a random one on first
/// run. An existing empty file means "no authentication required".
pub fn load_or_create_password(state_dir: &Path) -> Result<Option<String>> {
    let path = state_dir.join(RPC_AUTH_FILE);
    if path.exists() {
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let password = contents.trim().to_string();
        return Ok((!password.is_empty()).then_some(password));
    }

    let mut bytes = [0u8; 16];
    rand::thread_rng().fill(&mut bytes);
    let password: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    std::fs::write(&path, &password)
        .with_context(|| format!("failed to write {}", path.display()))?;
    #[cfg(unix)]
    {
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).ok();
    }
    tracing::info!(path = %path.display(), "generated management RPC password");
    Ok(Some(password))
}

/// Per-connection authentication handshake state.
///
/// Connections from the local host are trusted and skip the handshake.
/// Everyone else gets a nonce (`auth1`) and must answer with
/// `md5(nonce + password)` (`auth2`). One unauthorized reply per
/// connection is forgiven; the second in a row closes it.
pub struct AuthSession {
    local: bool,
    password: Option<String>,
    nonce: Option<String>,
    authenticated: bool,
    sent_unauthorized: bool,
}

impl AuthSession {
    pub fn new(local: bool, password: Option<String>) -> Self {
        // No password configured means nothing to protect with.
        let authenticated = local || password.is_none();
        Self {
            local,
            password,
            nonce: None,
            authenticated,
            sent_unauthorized: false,
        }
    }

    pub fn authorized(&self) -> bool {
        self.authenticated
    }

    pub fn is_local(&self) -> bool {
        self.local
    }

    /// Grant authentication out of band (validated HTTP header auth).
    pub fn grant(&mut self) {
        self.authenticated = true;
    }

    /// A request was answered without an authorization failure; the
    /// forgiveness flag re-arms.
    pub fn note_success(&mut self) {
        self.sent_unauthorized = false;
    }

    /// Record an unauthorized reply. Returns whether the connection must
    /// close (second strike in a row).
    pub fn unauthorized_strike(&mut self) -> bool {
        let close = self.sent_unauthorized;
        self.sent_unauthorized = true;
        close
    }

    /// Handle `auth1`: issue a time-based nonce.
    pub fn auth1(&mut self, now_ms: u64) -> Response {
        let suffix: u32 = rand::thread_rng().r#gen();
        let nonce = format!("{now_ms}.{suffix:08x}");
        self.nonce = Some(nonce.clone());
        Response::Nonce { nonce }
    }

    /// Handle `auth2`: verify the digest for the previously issued nonce.
    /// Returns the reply plus whether the connection must close.
    pub fn auth2(&mut self, nonce_hash: &str) -> (Response, bool) {
        let ok = match (&self.password, self.nonce.take()) {
            // Nothing to authenticate against; accept.
            (None, _) => true,
            (Some(_), None) => false,
            (Some(password), Some(nonce)) => auth2_hash(&nonce, password) == nonce_hash,
        };
        if ok {
            self.authenticated = true;
            self.note_success();
            (Response::ok(None), false)
        } else {
            let close = self.unauthorized_strike();
            (Response::Unauthorized, close)
        }
    }

    /// Verify the HTTP header auth scheme for one request. `last_seqno`
    /// is the highest seqno previously accepted for this ID; the caller
    /// persists the new value on success.
    pub fn verify_header_auth(
        &self,
        auth_id: &str,
        seqno: u64,
        hash: &str,
        last_seqno: Option<u64>,
    ) -> bool {
        let Some(password) = &self.password else {
            return true;
        };
        if let Some(last) = last_seqno {
            if seqno <= last {
                return false;
            }
        }
        gridmate::protocol::http_auth_hash(auth_id, seqno, password) == hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_is_generated_once_with_tight_mode() {
        let dir = tempfile::tempdir().unwrap();
        let first = load_or_create_password(dir.path()).unwrap().unwrap();
        let second = load_or_create_password(dir.path()).unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 32);

        #[cfg(unix)]
        {
            let meta = std::fs::metadata(dir.path().join(RPC_AUTH_FILE)).unwrap();
            assert_eq!(meta.permissions().mode() & 0o777, 0o600);
        }
    }

    #[test]
    fn empty_password_file_disables_auth() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(RPC_AUTH_FILE), "\n").unwrap();
        assert!(load_or_create_password(dir.path()).unwrap().is_none());
    }

    #[test]
    fn local_sessions_skip_the_handshake() {
        let session = AuthSession::new(true, Some("pw".to_string()));
        assert!(session.authorized());
    }

    #[test]
    fn handshake_succeeds_with_correct_digest() {
        let mut session = AuthSession::new(false, Some("pw".to_string()));
        assert!(!session.authorized());
        let Response::Nonce { nonce } = session.auth1(1_000) else {
            panic!("expected nonce");
        };
        let (resp, close) = session.auth2(&auth2_hash(&nonce, "pw"));
        assert!(matches!(resp, Response::Ok { .. }));
        assert!(!close);
        assert!(session.authorized());
    }

    #[test]
    fn second_bad_digest_in_a_row_closes() {
        let mut session = AuthSession::new(false, Some("pw".to_string()));
        session.auth1(1_000);
        let (resp, close) = session.auth2("wrong");
        assert!(matches!(resp, Response::Unauthorized));
        assert!(!close);

        session.auth1(2_000);
        let (resp, close) = session.auth2("wrong again");
        assert!(matches!(resp, Response::Unauthorized));
        assert!(close);
    }

    #[test]
    fn header_auth_requires_increasing_seqno() {
        let session = AuthSession::new(false, Some("pw".to_string()));
        let hash = gridmate::protocol::http_auth_hash("console-1", 5, "pw");
        assert!(session.verify_header_auth("console-1", 5, &hash, Some(4)));
        assert!(!session.verify_header_auth("console-1", 5, &hash, Some(5)));
        assert!(!session.verify_header_auth("console-1", 5, "bogus", Some(4)));
    }
}
