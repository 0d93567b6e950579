//! Thin wrappers over the process environment. `std::env` already
//! returns `Option`/`Result` so there is no `errno`-threading to
//! preserve here beyond matching which failure mode maps to which
//! condition.

use std::ffi::OsString;

use crate::error::RuntimeError;

pub fn get_string(name: &str) -> Result<OsString, RuntimeError> {
    std::env::var_os(name).ok_or_else(|| RuntimeError::Other(format!("{name} is not set")))
}

pub fn set_string(name: &str, value: &str) {
    std::env::set_var(name, value);
}

pub fn delete(name: &str) -> Result<(), RuntimeError> {
    if std::env::var_os(name).is_none() {
        return Err(RuntimeError::Other(format!("{name} is not set")));
    }
    std::env::remove_var(name);
    Ok(())
}

pub fn get_int(name: &str) -> Result<i64, RuntimeError> {
    let value = get_string(name)?;
    value
        .to_string_lossy()
        .trim()
        .parse()
        .map_err(|_| RuntimeError::Other(format!("{name} is not a valid integer")))
}

pub fn set_int(name: &str, value: i64) {
    set_string(name, &value.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_string() {
        set_string("DAEMONRT_TEST_ENV_STRING", "hello");
        assert_eq!(get_string("DAEMONRT_TEST_ENV_STRING").unwrap(), "hello");
        delete("DAEMONRT_TEST_ENV_STRING").unwrap();
        assert!(get_string("DAEMONRT_TEST_ENV_STRING").is_err());
    }

    #[test]
    fn round_trips_an_int() {
        set_int("DAEMONRT_TEST_ENV_INT", -42);
        assert_eq!(get_int("DAEMONRT_TEST_ENV_INT").unwrap(), -42);
        delete("DAEMONRT_TEST_ENV_INT").unwrap();
    }

    #[test]
    fn deleting_an_unset_variable_fails() {
        assert!(delete("DAEMONRT_TEST_ENV_DOES_NOT_EXIST").is_err());
    }
}
