//! User-facing CLI I/O: JSON results on stdout, operator notices and prompts on stderr.

use eyre::Context as _;
use secrecy::{ExposeSecret as _, SecretString};
use serde::Serialize;
use std::io::{IsTerminal as _, Write as _};

/// Non-interactive password source, checked before prompting.
pub const PASSWORD_ENV: &str = "INTERCOM_PASSWORD";
/// Non-interactive source for `init --import`.
pub const MNEMONIC_ENV: &str = "INTERCOM_MNEMONIC";

pub fn print_json<T: Serialize + ?Sized>(v: &T) -> eyre::Result<()> {
    let s = serde_json::to_string_pretty(v).context("serialize output")?;
    writeln!(std::io::stdout().lock(), "{s}").context("write output")?;
    Ok(())
}

pub fn notice(s: &str) {
    let mut stderr = std::io::stderr().lock();
    if stderr.write_all(s.as_bytes()).is_err() {
        return;
    }
    if stderr.write_all(b"\n").is_err() {
        return;
    }
    let _flush = stderr.flush();
}

/// Read a password from `INTERCOM_PASSWORD`, or prompt on the terminal.
///
/// With `confirm`, an interactive prompt asks twice and rejects a mismatch.
pub fn read_password(prompt: &str, confirm: bool) -> eyre::Result<SecretString> {
    if let Ok(v) = std::env::var(PASSWORD_ENV) {
        return Ok(SecretString::new(v.into()));
    }
    if !std::io::stdin().is_terminal() {
        eyre::bail!("no terminal for password prompt; set {PASSWORD_ENV}");
    }
    let first = SecretString::new(
        rpassword::prompt_password(prompt)
            .context("read password")?
            .into(),
    );
    if confirm {
        let again = rpassword::prompt_password("Confirm password: ").context("read password")?;
        if again != first.expose_secret() {
            eyre::bail!("passwords do not match");
        }
    }
    Ok(first)
}

/// Read a recovery phrase for import. Uses the same prompt path so it never echoes.
pub fn read_mnemonic() -> eyre::Result<SecretString> {
    if let Ok(v) = std::env::var(MNEMONIC_ENV) {
        return Ok(SecretString::new(v.into()));
    }
    if !std::io::stdin().is_terminal() {
        eyre::bail!("no terminal for recovery phrase prompt; set {MNEMONIC_ENV}");
    }
    let m = rpassword::prompt_password("Recovery phrase: ").context("read recovery phrase")?;
    Ok(SecretString::new(m.into()))
}
