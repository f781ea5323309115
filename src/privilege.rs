use crate::error::PrivilegeError;

#[cfg(windows)]
pub fn is_elevated() -> Result<bool, PrivilegeError> {
    use windows::Win32::Foundation::{CloseHandle, HANDLE};
    use windows::Win32::Security::{GetTokenInformation, TOKEN_ELEVATION, TOKEN_QUERY, TokenElevation};
    use windows::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};

    unsafe {
        let mut token = HANDLE::default();
        OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token)
            .map_err(|e| PrivilegeError::TokenQuery(format!("OpenProcessToken: {e}")))?;
        let mut elevation = TOKEN_ELEVATION::default();
        let mut len = 0u32;
        let res = GetTokenInformation(
            token,
            TokenElevation,
            Some(&mut elevation as *mut _ as *mut _),
            std::mem::size_of::<TOKEN_ELEVATION>() as u32,
            &mut len,
        );
        let _ = CloseHandle(token);
        res.map_err(|e| PrivilegeError::TokenQuery(format!("GetTokenInformation: {e}")))?;
        Ok(elevation.TokenIsElevated != 0)
    }
}

#[cfg(not(windows))]
pub fn is_elevated() -> Result<bool, PrivilegeError> {
    Ok(false)
}

fn require(elevated: bool) -> Result<(), PrivilegeError> {
    if elevated {
        Ok(())
    } else {
        Err(PrivilegeError::InsufficientPrivilege)
    }
}

/// Abort unless the process token is elevated.
pub fn ensure_elevated() -> Result<(), PrivilegeError> {
    let elevated = is_elevated()?;
    tracing::debug!("Process token elevated: {}", elevated);
    require(elevated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unelevated_token_is_rejected() {
        assert!(require(true).is_ok());
        assert!(matches!(require(false), Err(PrivilegeError::InsufficientPrivilege)));
    }
}
