//! Storage account connection strings.
//!
//! A connection string is a `;`-separated list of `key=value` settings.
//! Values may themselves contain `=` (base64 keys, SAS tokens).

use std::fmt;

use zeroize::Zeroizing;

use crate::error::ConfigError;

/// Default endpoint suffix for public cloud accounts.
pub const DEFAULT_ENDPOINT_SUFFIX: &str = "core.windows.net";

/// Account name of the local storage emulator.
pub const DEVELOPMENT_ACCOUNT_NAME: &str = "devstoreaccount1";

/// Connection string selecting the local storage emulator.
pub const DEVELOPMENT_CONNECTION_STRING: &str = "UseDevelopmentStorage=true";

/// Published key of the local storage emulator.
pub const DEVELOPMENT_ACCOUNT_KEY: &str =
    "Eby8vdM02xNOcqFlqUwJPLlmEtlCDXJ1OUzFT50uSRZ6IFsuFq2UVErCz4I6tq/K1SZFPTOtr/KBHBeksoGMGw==";

/// How requests against the account are authorized.
#[derive(Clone)]
pub enum Credentials {
    /// Shared account key, base64 encoded.
    AccountKey(Zeroizing<String>),
    /// Shared access signature query string, without the leading `?`.
    SharedAccessSignature(Zeroizing<String>),
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AccountKey(_) => f.write_str("AccountKey(<redacted>)"),
            Self::SharedAccessSignature(_) => f.write_str("SharedAccessSignature(<redacted>)"),
        }
    }
}

/// A parsed storage account.
#[derive(Debug, Clone)]
pub struct StorageAccount {
    name: String,
    credentials: Credentials,
    table_endpoint: String,
    blob_endpoint: String,
    development: bool,
}

fn invalid(reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidConnectionString { reason: reason.into() }
}

impl StorageAccount {
    /// The local emulator account.
    #[must_use]
    pub fn development() -> Self {
        Self {
            name: DEVELOPMENT_ACCOUNT_NAME.to_owned(),
            credentials: Credentials::AccountKey(Zeroizing::new(
                DEVELOPMENT_ACCOUNT_KEY.to_owned(),
            )),
            table_endpoint: format!("http://127.0.0.1:10002/{DEVELOPMENT_ACCOUNT_NAME}"),
            blob_endpoint: format!("http://127.0.0.1:10000/{DEVELOPMENT_ACCOUNT_NAME}"),
            development: true,
        }
    }

    /// Parses a connection string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidConnectionString`] for malformed
    /// segments, unrecognised settings, missing account names or missing
    /// credentials.
    pub fn parse(connection_string: &str) -> Result<Self, ConfigError> {
        let mut protocol = None;
        let mut name = None;
        let mut key = None;
        let mut sas = None;
        let mut suffix = None;
        let mut table_endpoint = None;
        let mut blob_endpoint = None;
        let mut development = false;

        for segment in connection_string.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            let (setting, value) = segment
                .split_once('=')
                .ok_or_else(|| invalid(format!("segment without '=': {segment:?}")))?;
            let value = value.trim();
            match setting.trim().to_ascii_lowercase().as_str() {
                "defaultendpointsprotocol" => protocol = Some(value.to_ascii_lowercase()),
                "accountname" => name = Some(value.to_owned()),
                "accountkey" => key = Some(Zeroizing::new(value.to_owned())),
                "sharedaccesssignature" => {
                    sas = Some(Zeroizing::new(value.trim_start_matches('?').to_owned()));
                },
                "endpointsuffix" => suffix = Some(value.to_owned()),
                "tableendpoint" => table_endpoint = Some(value.trim_end_matches('/').to_owned()),
                "blobendpoint" => blob_endpoint = Some(value.trim_end_matches('/').to_owned()),
                "usedevelopmentstorage" => development = value.eq_ignore_ascii_case("true"),
                "queueendpoint" | "fileendpoint" => {},
                other => return Err(invalid(format!("unrecognised setting {other:?}"))),
            }
        }

        if development {
            return Ok(Self::development());
        }

        let name = match name {
            Some(name) if !name.is_empty() => name,
            _ => table_endpoint
                .as_deref()
                .or(blob_endpoint.as_deref())
                .and_then(account_from_endpoint)
                .ok_or_else(|| invalid("missing AccountName"))?,
        };

        let credentials = match (key, sas) {
            (Some(key), _) if !key.is_empty() => Credentials::AccountKey(key),
            (_, Some(sas)) if !sas.is_empty() => Credentials::SharedAccessSignature(sas),
            _ => return Err(invalid("missing AccountKey or SharedAccessSignature")),
        };

        let protocol = protocol.unwrap_or_else(|| "https".to_owned());
        if protocol != "https" && protocol != "http" {
            return Err(invalid(format!("unsupported protocol {protocol:?}")));
        }
        let suffix = suffix.unwrap_or_else(|| DEFAULT_ENDPOINT_SUFFIX.to_owned());
        let derive = |service: &str| format!("{protocol}://{name}.{service}.{suffix}");

        Ok(Self {
            table_endpoint: table_endpoint.unwrap_or_else(|| derive("table")),
            blob_endpoint: blob_endpoint.unwrap_or_else(|| derive("blob")),
            name,
            credentials,
            development: false,
        })
    }

    /// The account name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// How requests are authorized.
    #[must_use]
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Base URI of the table service, without a trailing slash.
    #[must_use]
    pub fn table_endpoint(&self) -> &str {
        &self.table_endpoint
    }

    /// Base URI of the blob service, without a trailing slash.
    #[must_use]
    pub fn blob_endpoint(&self) -> &str {
        &self.blob_endpoint
    }

    /// Returns `true` for the local emulator account.
    #[must_use]
    pub fn is_development(&self) -> bool {
        self.development
    }

    /// Identity used to key cached references: the table endpoint.
    #[must_use]
    pub fn connection_identity(&self) -> &str {
        &self.table_endpoint
    }
}

impl std::str::FromStr for StorageAccount {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn account_from_endpoint(endpoint: &str) -> Option<String> {
    let host = endpoint.split_once("://").map_or(endpoint, |(_, rest)| rest);
    let label = host.split(['.', '/', ':']).next()?;
    (!label.is_empty()).then(|| label.to_owned())
}
