//! Turning stored or submitted secrets into session credentials

use std::time::Duration;

use secrecy::SecretString;

use crate::errors::{ConnectError, OrchestratorError};
use crate::remote::session::{ConnectParams, Credential};
use crate::store::TargetRecord;
use crate::vault::Vault;

pub const AUTH_PASSWORD: &str = "password";
pub const AUTH_KEY: &str = "key";

/// Decrypt the credential a target is configured to use.
///
/// Runs before any network call so a vault failure never opens a connection.
pub fn resolve_target_credential(
    vault: &Vault,
    target: &TargetRecord,
) -> Result<Credential, OrchestratorError> {
    match target.auth_type.as_str() {
        AUTH_KEY => {
            let blob = target
                .private_key_encrypted
                .as_deref()
                .filter(|_| target.has_private_key)
                .ok_or_else(|| {
                    ConnectError::InvalidCredential(format!(
                        "target {} has no private key stored",
                        target.name
                    ))
                })?;
            let key = vault.decrypt(blob)?;
            let passphrase = target
                .passphrase_encrypted
                .as_deref()
                .map(|blob| vault.decrypt(blob))
                .transpose()?;
            Ok(Credential::PrivateKey { key, passphrase })
        }
        AUTH_PASSWORD => {
            let blob = target
                .password_encrypted
                .as_deref()
                .filter(|_| target.has_password)
                .ok_or_else(|| {
                    ConnectError::InvalidCredential(format!(
                        "target {} has no password stored",
                        target.name
                    ))
                })?;
            Ok(Credential::Password(vault.decrypt(blob)?))
        }
        other => Err(OrchestratorError::ValidationError(format!(
            "unknown auth_type {:?} on target {}",
            other, target.name
        ))),
    }
}

/// Build a credential from plaintext fields submitted with a request.
///
/// Exactly one of password or private key is used. An empty auth type picks
/// whichever secret is present.
pub fn credential_from_plain(
    auth_type: &str,
    password: Option<&str>,
    private_key: Option<&str>,
    passphrase: Option<&str>,
) -> Result<Credential, ConnectError> {
    let secret = |s: &str| SecretString::from(s.to_string());
    fn non_blank(s: Option<&str>) -> Option<&str> {
        s.filter(|v| !v.trim().is_empty())
    }

    let mode = match auth_type {
        "" if non_blank(private_key).is_some() => AUTH_KEY,
        "" if non_blank(password).is_some() => AUTH_PASSWORD,
        "" => {
            return Err(ConnectError::InvalidCredential(
                "either a password or a private key must be supplied".to_string(),
            ))
        }
        other => other,
    };

    match mode {
        AUTH_KEY => {
            let key = non_blank(private_key).ok_or_else(|| {
                ConnectError::InvalidCredential("private key is empty".to_string())
            })?;
            Ok(Credential::PrivateKey {
                key: secret(key),
                passphrase: non_blank(passphrase).map(secret),
            })
        }
        AUTH_PASSWORD => {
            let password = password
                .filter(|p| !p.is_empty())
                .ok_or_else(|| ConnectError::InvalidCredential("password is empty".to_string()))?;
            Ok(Credential::Password(secret(password)))
        }
        other => Err(ConnectError::InvalidCredential(format!(
            "unknown auth_type {:?}",
            other
        ))),
    }
}

/// Check a port number taken from a record or request
pub fn valid_port(port: i64) -> Result<u16, OrchestratorError> {
    u16::try_from(port)
        .ok()
        .filter(|p| *p > 0)
        .ok_or_else(|| OrchestratorError::ValidationError(format!("invalid ssh port {}", port)))
}

/// Connection parameters for a stored target
pub fn target_connect_params(
    target: &TargetRecord,
    credential: Credential,
    timeout: Duration,
) -> Result<ConnectParams, OrchestratorError> {
    Ok(ConnectParams {
        host: target.host.clone(),
        port: valid_port(target.ssh_port)?,
        user: target.ssh_user.clone(),
        credential,
        timeout,
    })
}
