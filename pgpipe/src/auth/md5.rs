//! MD5 password authentication.
use md5::{Digest, Md5};

/// Compute the password to answer an `AuthenticationMD5Password` request.
///
/// `"md5" + hex(md5(hex(md5(password + user)) + salt))`
pub fn md5_password(user: &str, password: &str, salt: [u8; 4]) -> String {
    let mut hasher = Md5::new();
    hasher.update(password.as_bytes());
    hasher.update(user.as_bytes());
    let inner = hex(&hasher.finalize());

    let mut hasher = Md5::new();
    hasher.update(inner.as_bytes());
    hasher.update(salt);

    format!("md5{}", hex(&hasher.finalize()))
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn known_hash() {
        let hash = md5_password("postgres", "password", [1, 2, 3, 4]);
        assert_eq!(hash, "md598511ceaec347a656f032c7f2a16ef17");
        assert_eq!(hash.len(), 35);
    }
}
