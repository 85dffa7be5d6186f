//! SCRAM-SHA-256 authentication with optional `tls-server-end-point` channel binding.
//!
//! The exchange is strictly linear:
//!
//! 1. [`start_session`] on `AuthenticationSASL`, send client-first-message
//! 2. [`continue_session`] on `AuthenticationSASLContinue`, send client-final-message
//! 3. [`finalize_session`] on `AuthenticationSASLFinal`, verify the server signature
//!
//! Each step consumes the [`SaslSession`] of the previous one.
//!
//! <https://www.postgresql.org/docs/current/sasl-authentication.html>
//! <https://www.rfc-editor.org/rfc/rfc5802>
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::fmt;
use subtle::ConstantTimeEq;

use super::cert;
use crate::common::verbose;

type HmacSha256 = Hmac<Sha256>;

pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";
pub const SCRAM_SHA_256_PLUS: &str = "SCRAM-SHA-256-PLUS";

/// Random bytes in the client nonce, before base64.
const NONCE_LEN: usize = 18;

/// Highest PBKDF2 iteration count accepted from the server.
pub const MAX_ITERATIONS: u32 = 10_000_000;

/// Selected SASL mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    ScramSha256,
    /// With `tls-server-end-point` channel binding.
    ScramSha256Plus,
}

impl Mechanism {
    pub fn name(&self) -> &'static str {
        match self {
            Mechanism::ScramSha256 => SCRAM_SHA_256,
            Mechanism::ScramSha256Plus => SCRAM_SHA_256_PLUS,
        }
    }
}

/// GS2 channel binding flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gs2 {
    /// Client does not support channel binding.
    No,
    /// Client supports channel binding, but the server does not offer it.
    Yes,
    /// Client uses `tls-server-end-point` channel binding.
    EndPoint,
}

impl Gs2 {
    fn header(&self) -> &'static str {
        match self {
            Gs2::No => "n",
            Gs2::Yes => "y",
            Gs2::EndPoint => "p=tls-server-end-point",
        }
    }
}

/// In progress SCRAM exchange.
pub struct SaslSession {
    mechanism: Mechanism,
    gs2: Gs2,
    client_nonce: String,
    client_first_bare: String,
    stage: Stage,
}

enum Stage {
    /// client-first-message sent.
    ClientFirst,
    /// client-final-message sent, expecting `server_signature`.
    ClientFinal { server_signature: [u8; 32] },
}

impl SaslSession {
    /// The mechanism chosen by [`start_session`].
    pub fn mechanism(&self) -> Mechanism {
        self.mechanism
    }
}

impl fmt::Debug for SaslSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self.stage {
            Stage::ClientFirst => "ClientFirst",
            Stage::ClientFinal { .. } => "ClientFinal",
        };
        f.debug_struct("SaslSession")
            .field("mechanism", &self.mechanism)
            .field("stage", &stage)
            .finish_non_exhaustive()
    }
}

/// Choose a mechanism from the server offered `mechanisms` and build the client-first-message.
///
/// `channel_binding` is whether the transport is TLS with the peer certificate available,
/// `SCRAM-SHA-256-PLUS` is preferred in that case.
pub fn start_session<S: AsRef<str>>(
    mechanisms: &[S],
    channel_binding: bool,
) -> Result<(SaslSession, Vec<u8>), SaslError> {
    start_with_nonce(mechanisms, channel_binding, generate_nonce())
}

fn start_with_nonce<S: AsRef<str>>(
    mechanisms: &[S],
    channel_binding: bool,
    client_nonce: String,
) -> Result<(SaslSession, Vec<u8>), SaslError> {
    let offered = |name: &str| mechanisms.iter().any(|m| m.as_ref() == name);

    let (mechanism, gs2) = if channel_binding && offered(SCRAM_SHA_256_PLUS) {
        (Mechanism::ScramSha256Plus, Gs2::EndPoint)
    } else if offered(SCRAM_SHA_256) {
        (Mechanism::ScramSha256, if channel_binding { Gs2::Yes } else { Gs2::No })
    } else {
        let offered = mechanisms.iter().map(AsRef::as_ref).collect::<Vec<_>>().join(", ");
        return Err(SaslError::UnsupportedMechanism(offered));
    };

    verbose!(mechanism = mechanism.name(), "sasl session started");

    // the user name is taken from the startup message
    let client_first_bare = format!("n=*,r={client_nonce}");
    let client_first = format!("{},,{client_first_bare}", gs2.header());

    let session = SaslSession {
        mechanism,
        gs2,
        client_nonce,
        client_first_bare,
        stage: Stage::ClientFirst,
    };

    Ok((session, client_first.into_bytes()))
}

/// Verify the server-first-message and build the client-final-message with the client proof.
///
/// `peer_certificate` is the DER encoded TLS leaf certificate, required for `SCRAM-SHA-256-PLUS`.
pub fn continue_session(
    session: SaslSession,
    password: &str,
    server_first: &[u8],
    peer_certificate: Option<&[u8]>,
) -> Result<(SaslSession, Vec<u8>), SaslError> {
    if !matches!(session.stage, Stage::ClientFirst) {
        return Err(SaslError::OutOfOrder("SASLContinue received after client-final-message"));
    }
    if password.is_empty() {
        return Err(SaslError::EmptyPassword);
    }

    let server_first = std::str::from_utf8(server_first)
        .map_err(|_| SaslError::Malformed("server-first-message is not valid utf-8"))?;
    let attrs = Attributes::parse(server_first)?;

    if let Some(err) = attrs.get('e') {
        return Err(SaslError::ServerError(err.into()));
    }

    let nonce = attrs.required('r')?;
    if !nonce.bytes().all(|b| b.is_ascii_graphic() && b != b',') {
        return Err(SaslError::Malformed("nonce must only contain printable characters"));
    }
    if !nonce.starts_with(&session.client_nonce) {
        return Err(SaslError::NonceMismatch);
    }
    if nonce.len() == session.client_nonce.len() {
        return Err(SaslError::NonceTooShort);
    }

    let salt = BASE64
        .decode(attrs.required('s')?)
        .map_err(|_| SaslError::Malformed("salt must be base64"))?;

    let iterations = attrs.required('i')?;
    if !iterations.starts_with(|c: char| matches!(c, '1'..='9')) {
        return Err(SaslError::Malformed("iteration count must be a positive integer"));
    }
    let iterations: u32 = iterations
        .parse()
        .map_err(|_| SaslError::Malformed("iteration count must be a positive integer"))?;
    if iterations > MAX_ITERATIONS {
        return Err(SaslError::TooManyIterations(iterations));
    }

    let channel_binding = match session.gs2 {
        Gs2::EndPoint => {
            let certificate = peer_certificate.ok_or(SaslError::ChannelBindingUnavailable)?;
            let hash = cert::end_point_hash(certificate).ok_or(SaslError::UnsupportedCertificate)?;
            let mut data = format!("{},,", Gs2::EndPoint.header()).into_bytes();
            data.extend_from_slice(&hash);
            BASE64.encode(data)
        },
        gs2 => BASE64.encode(format!("{},,", gs2.header())),
    };

    let client_final_without_proof = format!("c={channel_binding},r={nonce}");
    let auth_message = format!(
        "{},{server_first},{client_final_without_proof}",
        session.client_first_bare,
    );

    let mut salted_password = [0u8; 32];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, iterations, &mut salted_password);

    let client_key = hmac(&salted_password, b"Client Key");
    let stored_key: [u8; 32] = Sha256::digest(client_key).into();
    let client_signature = hmac(&stored_key, auth_message.as_bytes());

    let mut client_proof = client_key;
    for (p, s) in client_proof.iter_mut().zip(client_signature) {
        *p ^= s;
    }

    let server_key = hmac(&salted_password, b"Server Key");
    let server_signature = hmac(&server_key, auth_message.as_bytes());

    let client_final = format!("{client_final_without_proof},p={}", BASE64.encode(client_proof));

    let session = SaslSession {
        stage: Stage::ClientFinal { server_signature },
        ..session
    };

    Ok((session, client_final.into_bytes()))
}

/// Verify the server signature in the server-final-message.
///
/// Authentication must not be considered successful unless this returns `Ok`.
pub fn finalize_session(session: SaslSession, server_final: &[u8]) -> Result<(), SaslError> {
    let Stage::ClientFinal { server_signature } = session.stage else {
        return Err(SaslError::OutOfOrder("SASLFinal received before client-final-message"));
    };

    let server_final = std::str::from_utf8(server_final)
        .map_err(|_| SaslError::Malformed("server-final-message is not valid utf-8"))?;
    let attrs = Attributes::parse(server_final)?;

    if let Some(err) = attrs.get('e') {
        return Err(SaslError::ServerError(err.into()));
    }

    let verifier = BASE64
        .decode(attrs.required('v')?)
        .map_err(|_| SaslError::Malformed("server signature must be base64"))?;

    if bool::from(verifier.ct_eq(&server_signature)) {
        verbose!("sasl server signature verified");
        Ok(())
    } else {
        Err(SaslError::SignatureMismatch)
    }
}

fn generate_nonce() -> String {
    let bytes: [u8; NONCE_LEN] = rand::thread_rng().r#gen();
    BASE64.encode(bytes)
}

fn hmac(key: &[u8], data: &[u8]) -> [u8; 32] {
    // HMAC accepts keys of any length
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => unreachable!("hmac key of any size is valid"),
    };
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Comma separated `k=value` pairs.
struct Attributes<'a>(Vec<(char, &'a str)>);

impl<'a> Attributes<'a> {
    fn parse(message: &'a str) -> Result<Self, SaslError> {
        let mut attrs = vec![];
        for pair in message.split(',') {
            let mut chars = pair.chars();
            let (Some(key), Some('=')) = (chars.next(), chars.next()) else {
                return Err(SaslError::Malformed("invalid attribute pair entry"));
            };
            attrs.push((key, chars.as_str()));
        }
        Ok(Self(attrs))
    }

    fn get(&self, key: char) -> Option<&'a str> {
        self.0.iter().rev().find(|(k, _)| *k == key).map(|(_, v)| *v)
    }

    fn required(&self, key: char) -> Result<&'a str, SaslError> {
        self.get(key).ok_or(SaslError::MissingAttribute(key))
    }
}

/// An error during SASL authentication.
#[derive(Clone, PartialEq, Eq)]
pub enum SaslError {
    /// None of the server offered mechanisms is supported.
    UnsupportedMechanism(String),
    /// `SCRAM-SHA-256-PLUS` was chosen but the peer certificate is not available.
    ChannelBindingUnavailable,
    /// Peer certificate signature algorithm has no single hash function.
    UnsupportedCertificate,
    /// SCRAM requires a non-empty password.
    EmptyPassword,
    /// A SASL message arrived out of the exchange order.
    OutOfOrder(&'static str),
    /// Server message syntax or attribute value is invalid.
    Malformed(&'static str),
    /// Server message lacks a required attribute.
    MissingAttribute(char),
    /// Server nonce does not start with the client nonce.
    NonceMismatch,
    /// Server nonce is the client nonce without server part.
    NonceTooShort,
    /// Iteration count above [`MAX_ITERATIONS`].
    TooManyIterations(u32),
    /// Server sent `e=` error attribute.
    ServerError(String),
    /// Server signature does not match, the server does not know the password.
    SignatureMismatch,
}

impl std::error::Error for SaslError { }

impl fmt::Display for SaslError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SASL: ")?;
        match self {
            Self::UnsupportedMechanism(offered) => {
                write!(f, "only mechanism SCRAM-SHA-256 is currently supported, server offered [{offered}]")
            },
            Self::ChannelBindingUnavailable => f.write_str("channel binding requires the server certificate"),
            Self::UnsupportedCertificate => {
                f.write_str("cannot determine the server certificate signature hash for channel binding")
            },
            Self::EmptyPassword => f.write_str("client password must be a non-empty string"),
            Self::OutOfOrder(msg) => write!(f, "out of order message, {msg}"),
            Self::Malformed(msg) => write!(f, "malformed server message, {msg}"),
            Self::MissingAttribute(key) => write!(f, "server message is missing attribute `{key}`"),
            Self::NonceMismatch => f.write_str("server nonce does not start with client nonce"),
            Self::NonceTooShort => f.write_str("server nonce is too short"),
            Self::TooManyIterations(count) => {
                write!(f, "iteration count {count} exceeds the limit of {MAX_ITERATIONS}")
            },
            Self::ServerError(err) => write!(f, "server error: {err}"),
            Self::SignatureMismatch => f.write_str("server signature does not match"),
        }
    }
}

impl fmt::Debug for SaslError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const CLIENT_NONCE: &str = "rOprNGfwEbeRWgbNEkqO";
    const SERVER_FIRST: &str = "r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096";
    const SERVER_NONCE: &str = "rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0";

    /// Reference values for password `pencil` with an anonymous `n=*` user.
    const CLIENT_PROOF: &str = "3M3hagGCCg+02mpnZ9fgyMWejs8yYlqFo7tFZyBIV5g=";
    const SERVER_SIGNATURE: &str = "jBUU2ZmyQ4x+QJe05Kx6JFwPHDsiK3tfmR51qZfjEOY=";

    fn start(mechanisms: &[&str], channel_binding: bool) -> (SaslSession, String) {
        let (session, first) = start_with_nonce(mechanisms, channel_binding, CLIENT_NONCE.into()).unwrap();
        (session, String::from_utf8(first).unwrap())
    }

    fn continued() -> (SaslSession, String) {
        let (session, _) = start(&[SCRAM_SHA_256], false);
        let (session, last) = continue_session(session, "pencil", SERVER_FIRST.as_bytes(), None).unwrap();
        (session, String::from_utf8(last).unwrap())
    }

    #[test]
    fn mechanism_selection() {
        let (session, first) = start(&[SCRAM_SHA_256_PLUS, SCRAM_SHA_256], true);
        assert_eq!(session.mechanism(), Mechanism::ScramSha256Plus);
        assert_eq!(first, format!("p=tls-server-end-point,,n=*,r={CLIENT_NONCE}"));

        let (session, first) = start(&[SCRAM_SHA_256_PLUS, SCRAM_SHA_256], false);
        assert_eq!(session.mechanism(), Mechanism::ScramSha256);
        assert_eq!(first, format!("n,,n=*,r={CLIENT_NONCE}"));

        let (session, first) = start(&[SCRAM_SHA_256], true);
        assert_eq!(session.mechanism(), Mechanism::ScramSha256);
        assert_eq!(first, format!("y,,n=*,r={CLIENT_NONCE}"));

        let err = start_session(&["SCRAM-SHA-1"], false).unwrap_err();
        assert_eq!(err, SaslError::UnsupportedMechanism("SCRAM-SHA-1".into()));
    }

    #[test]
    fn generated_nonce() {
        let (session, first) = start_session(&[SCRAM_SHA_256], false).unwrap();
        assert_eq!(session.client_nonce.len(), 24);
        assert!(String::from_utf8(first).unwrap().starts_with("n,,n=*,r="));
    }

    #[test]
    fn client_proof_matches_reference() {
        let (_, last) = continued();
        assert_eq!(last, format!("c=biws,r={SERVER_NONCE},p={CLIENT_PROOF}"));
    }

    #[test]
    fn client_proof_independently_computed() {
        let salt = BASE64.decode("W22ZaJ0SNY7soEsUEjb6gQ==").unwrap();
        let mut salted = [0u8; 32];
        pbkdf2_hmac::<Sha256>(b"pencil", &salt, 4096, &mut salted);

        let auth_message = format!("n=*,r={CLIENT_NONCE},{SERVER_FIRST},c=biws,r={SERVER_NONCE}");
        let mut mac = HmacSha256::new_from_slice(&salted).unwrap();
        mac.update(b"Client Key");
        let client_key = mac.finalize().into_bytes();
        let stored_key = Sha256::digest(client_key);
        let mut mac = HmacSha256::new_from_slice(&stored_key).unwrap();
        mac.update(auth_message.as_bytes());
        let signature = mac.finalize().into_bytes();
        let proof: Vec<u8> = client_key.iter().zip(signature).map(|(k, s)| k ^ s).collect();

        assert_eq!(BASE64.encode(proof), CLIENT_PROOF);
    }

    #[test]
    fn server_signature_accepted() {
        let (session, _) = continued();
        finalize_session(session, format!("v={SERVER_SIGNATURE}").as_bytes()).unwrap();
    }

    #[test]
    fn flipped_server_signature_rejected() {
        let signature = BASE64.decode(SERVER_SIGNATURE).unwrap();
        for bit in [0, 7, 100, 255] {
            let mut flipped = signature.clone();
            flipped[bit / 8] ^= 1 << (bit % 8);
            let (session, _) = continued();
            let err = finalize_session(session, format!("v={}", BASE64.encode(flipped)).as_bytes()).unwrap_err();
            assert_eq!(err, SaslError::SignatureMismatch);
        }
    }

    #[test]
    fn nonce_checks() {
        let (session, _) = start(&[SCRAM_SHA_256], false);
        let err = continue_session(session, "pencil", b"r=other,s=QSXCR+Q6sek8bf92,i=4096", None).unwrap_err();
        assert_eq!(err, SaslError::NonceMismatch);

        let (session, _) = start(&[SCRAM_SHA_256], false);
        let first = format!("r={CLIENT_NONCE},s=QSXCR+Q6sek8bf92,i=4096");
        let err = continue_session(session, "pencil", first.as_bytes(), None).unwrap_err();
        assert_eq!(err, SaslError::NonceTooShort);
    }

    #[test]
    fn attribute_errors() {
        let cases: [(&str, SaslError); 6] = [
            ("r=abc,garbage", SaslError::Malformed("invalid attribute pair entry")),
            ("s=QSXCR+Q6sek8bf92,i=4096", SaslError::MissingAttribute('r')),
            (&format!("r={SERVER_NONCE},i=4096"), SaslError::MissingAttribute('s')),
            (&format!("r={SERVER_NONCE},s=QSXCR+Q6sek8bf92,i=0"), SaslError::Malformed("iteration count must be a positive integer")),
            (&format!("r={SERVER_NONCE},s=QSXCR+Q6sek8bf92,i=4294967295"), SaslError::TooManyIterations(u32::MAX)),
            ("e=invalid-proof", SaslError::ServerError("invalid-proof".into())),
        ];
        for (first, expect) in cases {
            let (session, _) = start(&[SCRAM_SHA_256], false);
            let err = continue_session(session, "pencil", first.as_bytes(), None).unwrap_err();
            assert_eq!(err, expect, "{first}");
        }

        let (session, _) = continued();
        assert_eq!(finalize_session(session, b"x").unwrap_err(), SaslError::Malformed("invalid attribute pair entry"));
        let (session, _) = continued();
        assert_eq!(finalize_session(session, b"a=b").unwrap_err(), SaslError::MissingAttribute('v'));
        let (session, _) = continued();
        assert_eq!(finalize_session(session, b"v=***").unwrap_err(), SaslError::Malformed("server signature must be base64"));
    }

    #[test]
    fn out_of_order() {
        let (session, _) = start(&[SCRAM_SHA_256], false);
        let err = finalize_session(session, format!("v={SERVER_SIGNATURE}").as_bytes()).unwrap_err();
        assert!(matches!(err, SaslError::OutOfOrder(_)));

        let (session, _) = continued();
        let err = continue_session(session, "pencil", SERVER_FIRST.as_bytes(), None).unwrap_err();
        assert!(matches!(err, SaslError::OutOfOrder(_)));
    }

    #[test]
    fn empty_password() {
        let (session, _) = start(&[SCRAM_SHA_256], false);
        let err = continue_session(session, "", SERVER_FIRST.as_bytes(), None).unwrap_err();
        assert_eq!(err, SaslError::EmptyPassword);
    }

    #[test]
    fn channel_binding_data() {
        let certificate = cert::test::fake_certificate(&[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x0c]);

        let (session, _) = start(&[SCRAM_SHA_256_PLUS], true);
        let err = continue_session(session, "pencil", SERVER_FIRST.as_bytes(), None).unwrap_err();
        assert_eq!(err, SaslError::ChannelBindingUnavailable);

        let (session, _) = start(&[SCRAM_SHA_256_PLUS], true);
        let (_, last) = continue_session(session, "pencil", SERVER_FIRST.as_bytes(), Some(&certificate)).unwrap();
        let last = String::from_utf8(last).unwrap();

        let mut expect = b"p=tls-server-end-point,,".to_vec();
        expect.extend_from_slice(&sha2::Sha384::digest(&certificate));
        assert!(last.starts_with(&format!("c={},r=", BASE64.encode(expect))), "{last}");
    }

    #[test]
    fn binding_supported_but_not_offered() {
        let (session, _) = start(&[SCRAM_SHA_256], true);
        let (_, last) = continue_session(session, "pencil", SERVER_FIRST.as_bytes(), None).unwrap();
        assert!(String::from_utf8(last).unwrap().starts_with("c=eSws,"));
    }
}
