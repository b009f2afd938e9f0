//! Request authorization.
//!
//! Account-key credentials sign each request with the SharedKeyLite scheme:
//! an HMAC-SHA256 over
//!
//! ```text
//! {x-ms-date}\n/{account}{path}
//! ```
//!
//! keyed with the base64-decoded account key. Shared access signatures are
//! appended to the request's query string instead.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use cloudtable_storage::{Credentials, StorageAccount, Zeroizing};
use hmac::{Hmac, Mac};
use reqwest::Url;
use sha2::Sha256;

use crate::error::{RestError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Formats a timestamp the way the `x-ms-date` header expects.
#[must_use]
pub fn http_date(now: DateTime<Utc>) -> String {
    now.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Signs or decorates requests for one account.
#[derive(Clone)]
pub enum RequestSigner {
    /// SharedKeyLite with the decoded account key.
    SharedKey {
        /// Account name used in the canonicalized resource.
        account: String,
        /// Decoded key bytes.
        key: Zeroizing<Vec<u8>>,
    },
    /// SAS token appended to every URL.
    SharedAccessSignature(Zeroizing<String>),
}

impl std::fmt::Debug for RequestSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SharedKey { account, .. } => {
                f.debug_struct("SharedKey").field("account", account).finish_non_exhaustive()
            },
            Self::SharedAccessSignature(_) => f.write_str("SharedAccessSignature(<redacted>)"),
        }
    }
}

impl RequestSigner {
    /// Builds the signer for an account's credentials.
    ///
    /// # Errors
    ///
    /// Returns [`RestError::Signing`] when the account key is not valid
    /// base64.
    pub fn for_account(account: &StorageAccount) -> Result<Self> {
        match account.credentials() {
            Credentials::AccountKey(key) => {
                let decoded = STANDARD
                    .decode(key.as_bytes())
                    .map_err(|e| RestError::Signing(format!("account key is not base64: {e}")))?;
                Ok(Self::SharedKey {
                    account: account.name().to_owned(),
                    key: Zeroizing::new(decoded),
                })
            },
            Credentials::SharedAccessSignature(token) => {
                Ok(Self::SharedAccessSignature(token.clone()))
            },
        }
    }

    /// Appends the SAS token to `url`. Does nothing for shared keys.
    pub fn decorate(&self, url: &mut Url) {
        if let Self::SharedAccessSignature(token) = self {
            let query = match url.query() {
                Some(existing) if !existing.is_empty() => format!("{existing}&{}", token.as_str()),
                _ => token.as_str().to_owned(),
            };
            url.set_query(Some(&query));
        }
    }

    /// The `Authorization` header value for a request to `url` dated
    /// `date`, or `None` when the signer uses a SAS token.
    ///
    /// # Errors
    ///
    /// Returns [`RestError::Signing`] if the HMAC cannot be keyed.
    pub fn authorization(&self, date: &str, url: &Url) -> Result<Option<String>> {
        let Self::SharedKey { account, key } = self else {
            return Ok(None);
        };
        let string_to_sign = format!("{date}\n/{account}{}", url.path());
        let mut mac = HmacSha256::new_from_slice(key)
            .map_err(|e| RestError::Signing(format!("invalid key length: {e}")))?;
        mac.update(string_to_sign.as_bytes());
        let signature = STANDARD.encode(mac.finalize().into_bytes());
        Ok(Some(format!("SharedKeyLite {account}:{signature}")))
    }
}
