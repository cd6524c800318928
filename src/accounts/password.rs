use anyhow::Context;
use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use rand::rngs::OsRng;
use tracing::error;

use crate::config::PasswordConfig;

/// Argon2id hashing with configured cost.
///
/// Hashing is CPU bound, so both directions run on the blocking pool.
#[derive(Clone)]
pub struct Passwords {
    params: Params,
    /// Verified against when the account does not exist, so a miss costs
    /// as much as a wrong password.
    dummy_hash: String,
}

impl Passwords {
    pub fn new(cfg: &PasswordConfig) -> anyhow::Result<Self> {
        let params = Params::new(cfg.memory_kib, cfg.iterations, cfg.parallelism, None)
            .map_err(|e| anyhow::anyhow!("invalid argon2 params: {e}"))?;
        let dummy_hash = hash_with(&params, "timing-equalizer")?;
        Ok(Self { params, dummy_hash })
    }

    pub async fn hash(&self, plain: String) -> anyhow::Result<String> {
        let params = self.params.clone();
        tokio::task::spawn_blocking(move || hash_with(&params, &plain))
            .await
            .context("password hashing task")?
    }

    pub async fn verify(&self, plain: String, hash: String) -> anyhow::Result<bool> {
        let params = self.params.clone();
        tokio::task::spawn_blocking(move || verify_with(&params, &plain, &hash))
            .await
            .context("password verify task")?
    }

    /// Burns one verification so unknown emails are not faster than known ones.
    pub async fn verify_dummy(&self, plain: String) {
        let _ = self.verify(plain, self.dummy_hash.clone()).await;
    }
}

fn argon2(params: &Params) -> Argon2<'static> {
    Argon2::new(Algorithm::Argon2id, Version::V0x13, params.clone())
}

fn hash_with(params: &Params, plain: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = argon2(params)
        .hash_password(plain.as_bytes(), &salt)
        .map_err(|e| {
            error!(error = %e, "argon2 hash_password error");
            anyhow::anyhow!(e.to_string())
        })?
        .to_string();
    Ok(hash)
}

fn verify_with(params: &Params, plain: &str, hash: &str) -> anyhow::Result<bool> {
    let parsed = PasswordHash::new(hash).map_err(|e| {
        error!(error = %e, "argon2 parse hash error");
        anyhow::anyhow!(e.to_string())
    })?;
    match argon2(params).verify_password(plain.as_bytes(), &parsed) {
        Ok(()) => Ok(true),
        Err(argon2::password_hash::Error::Password) => Ok(false),
        Err(e) => Err(anyhow::anyhow!("argon2 verify error: {e}")),
    }
}
