//! The two-cookie credential carrier.
//!
//! `username` holds `<mac>.<session id>.<username>` where the MAC covers the
//! session id, the username and the password ciphertext together;
//! `password_ct` holds the authenticated ciphertext of the password. The MAC
//! and the ciphertext are base64url without padding.

use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use crate::cipher::Cipher;
use crate::credentials::percent_decode;
use crate::error::{Result, WorkbenchError};

pub const USERNAME_COOKIE: &str = "username";
pub const PASSWORD_COOKIE: &str = "password_ct";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCookie {
    pub username: String,
    pub password_ct: String,
}

/// Credentials recovered from a verified cookie.
#[derive(Clone, PartialEq, Eq)]
pub struct CookieCredentials {
    pub session_id: String,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for CookieCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CookieCredentials")
            .field("session_id", &self.session_id)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

fn mac_input(session_id: &str, username: &str, password_ct: &str) -> Vec<u8> {
    let mut data = Vec::with_capacity(session_id.len() + username.len() + password_ct.len() + 2);
    data.extend_from_slice(session_id.as_bytes());
    data.push(0);
    data.extend_from_slice(username.as_bytes());
    data.push(0);
    data.extend_from_slice(password_ct.as_bytes());
    data
}

/// RFC 6265 cookie-octet, minus `%` which introduces an escape.
fn is_cookie_octet(b: u8) -> bool {
    matches!(b, 0x21 | 0x23..=0x24 | 0x26..=0x2B | 0x2D..=0x3A | 0x3C..=0x5B | 0x5D..=0x7E)
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for &b in value.as_bytes() {
        if is_cookie_octet(b) {
            out.push(char::from(b));
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

impl SessionCookie {
    /// Binds the cookie to one session. The id must not contain `.`.
    pub fn issue(cipher: &Cipher, session_id: &str, username: &str, password: &str) -> Result<Self> {
        if session_id.is_empty() || session_id.contains('.') {
            return Err(WorkbenchError::Internal("session id cannot be carried in a cookie".to_string()));
        }
        let ciphertext = cipher.encrypt(password.as_bytes())?;
        let password_ct = URL_SAFE_NO_PAD.encode(ciphertext);
        let mac = cipher.sign(&mac_input(session_id, username, &password_ct));
        Ok(Self {
            username: format!(
                "{}.{}.{}",
                URL_SAFE_NO_PAD.encode(mac),
                escape(session_id),
                escape(username)
            ),
            password_ct,
        })
    }

    /// MAC first, then decrypt. Every failure is reported as tampering.
    pub fn open(&self, cipher: &Cipher) -> Result<CookieCredentials> {
        let mut parts = self.username.splitn(3, '.');
        let (Some(mac), Some(session_id), Some(escaped)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(WorkbenchError::TamperDetected);
        };
        let mac = URL_SAFE_NO_PAD
            .decode(mac)
            .map_err(|_| WorkbenchError::TamperDetected)?;
        let session_id = percent_decode(session_id).map_err(|_| WorkbenchError::TamperDetected)?;
        let username = percent_decode(escaped).map_err(|_| WorkbenchError::TamperDetected)?;
        if !cipher.verify(&mac_input(&session_id, &username, &self.password_ct), &mac) {
            return Err(WorkbenchError::TamperDetected);
        }

        let ciphertext = URL_SAFE_NO_PAD
            .decode(&self.password_ct)
            .map_err(|_| WorkbenchError::TamperDetected)?;
        let password = cipher
            .decrypt(&ciphertext)
            .map_err(|_| WorkbenchError::TamperDetected)?;
        let password = String::from_utf8(password).map_err(|_| WorkbenchError::TamperDetected)?;
        Ok(CookieCredentials {
            session_id,
            username,
            password,
        })
    }

    /// Reads both cookies from a `Cookie` request header value.
    pub fn from_header(header: &str) -> Result<Self> {
        let mut username = None;
        let mut password_ct = None;
        for pair in header.split(';') {
            let Some((name, value)) = pair.trim().split_once('=') else {
                continue;
            };
            match name.trim() {
                USERNAME_COOKIE if username.is_none() => username = Some(value.trim().to_string()),
                PASSWORD_COOKIE if password_ct.is_none() => password_ct = Some(value.trim().to_string()),
                _ => {}
            }
        }
        match (username, password_ct) {
            (Some(username), Some(password_ct)) if !username.is_empty() && !password_ct.is_empty() => {
                Ok(Self { username, password_ct })
            }
            (None, None) => Err(WorkbenchError::SessionNotFound),
            _ => Err(WorkbenchError::InputInvalid("incomplete session cookie".to_string())),
        }
    }

    pub fn set_cookie_headers(&self, secure: bool, max_age_seconds: Option<u64>) -> [String; 2] {
        let mut attributes = attributes(secure);
        if let Some(age) = max_age_seconds {
            attributes.push_str(&format!("; Max-Age={age}"));
        }
        [
            format!("{USERNAME_COOKIE}={}{attributes}", self.username),
            format!("{PASSWORD_COOKIE}={}{attributes}", self.password_ct),
        ]
    }

    pub fn clear_headers(secure: bool) -> [String; 2] {
        let attributes = attributes(secure);
        [
            format!("{USERNAME_COOKIE}={attributes}; Max-Age=0"),
            format!("{PASSWORD_COOKIE}={attributes}; Max-Age=0"),
        ]
    }
}

fn attributes(secure: bool) -> String {
    let mut out = String::from("; Path=/; HttpOnly; SameSite=Strict");
    if secure {
        out.push_str("; Secure");
    }
    out
}
