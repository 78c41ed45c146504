//! Windows VPN launcher: stores the code as a DPAPI-encrypted
//! `auth-data` registry value under the connection's OpenVPN-GUI config
//! key, triggers `openvpn-gui.exe`, and tails its log file for the
//! success/failure markers it writes.

use std::ffi::OsStr;
use std::os::windows::ffi::OsStrExt;
use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::process::Command;
use windows_sys::Win32::Foundation::LocalFree;
use windows_sys::Win32::Security::Cryptography::{CryptProtectData, CRYPT_INTEGER_BLOB};
use windows_sys::Win32::System::Registry::{
    RegCloseKey, RegGetValueW, RegOpenKeyExW, HKEY, HKEY_CURRENT_USER, HKEY_LOCAL_MACHINE,
    KEY_QUERY_VALUE, KEY_SET_VALUE, RRF_RT_REG_BINARY, RRF_RT_REG_SZ,
};

use crate::error::CardError;

const LOG_POLL_INTERVAL: Duration = Duration::from_millis(100);

fn wide(s: &str) -> Vec<u16> {
    OsStr::new(s).encode_wide().chain(std::iter::once(0)).collect()
}

fn fail(context: &str, err: impl std::fmt::Display) -> CardError {
    CardError::LauncherFailure(format!("{context}: {err}"))
}

/// Thin wrapper around an open `HKEY`, closed on drop.
struct RegKey(HKEY);

impl Drop for RegKey {
    fn drop(&mut self) {
        unsafe {
            RegCloseKey(self.0);
        }
    }
}

fn open_key(root: HKEY, path: &str, access: u32) -> Result<RegKey, CardError> {
    let wide_path = wide(path);
    let mut hkey: HKEY = std::ptr::null_mut();
    let status = unsafe { RegOpenKeyExW(root, wide_path.as_ptr(), 0, access, &mut hkey) };
    if status != 0 {
        return Err(fail(
            &format!("RegOpenKeyExW({path})"),
            format!("status {status}"),
        ));
    }
    Ok(RegKey(hkey))
}

fn get_binary_value(key: &RegKey, name: &str) -> Result<Vec<u8>, CardError> {
    let wide_name = wide(name);
    let mut size: u32 = 0;
    let status = unsafe {
        RegGetValueW(
            key.0,
            std::ptr::null(),
            wide_name.as_ptr(),
            RRF_RT_REG_BINARY,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            &mut size,
        )
    };
    if status != 0 {
        return Err(fail(&format!("RegGetValueW({name}) size query"), status));
    }
    let mut buf = vec![0u8; size as usize];
    let status = unsafe {
        RegGetValueW(
            key.0,
            std::ptr::null(),
            wide_name.as_ptr(),
            RRF_RT_REG_BINARY,
            std::ptr::null_mut(),
            buf.as_mut_ptr() as *mut _,
            &mut size,
        )
    };
    if status != 0 {
        return Err(fail(&format!("RegGetValueW({name})"), status));
    }
    buf.truncate(size as usize);
    Ok(buf)
}

fn get_string_value(key: &RegKey, name: &str) -> Result<String, CardError> {
    let wide_name = wide(name);
    let mut size: u32 = 0;
    let status = unsafe {
        RegGetValueW(
            key.0,
            std::ptr::null(),
            wide_name.as_ptr(),
            RRF_RT_REG_SZ,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            &mut size,
        )
    };
    if status != 0 {
        return Err(fail(&format!("RegGetValueW({name}) size query"), status));
    }
    let mut buf = vec![0u16; size as usize / 2];
    let status = unsafe {
        RegGetValueW(
            key.0,
            std::ptr::null(),
            wide_name.as_ptr(),
            RRF_RT_REG_SZ,
            std::ptr::null_mut(),
            buf.as_mut_ptr() as *mut _,
            &mut size,
        )
    };
    if status != 0 {
        return Err(fail(&format!("RegGetValueW({name})"), status));
    }
    let end = buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
    Ok(String::from_utf16_lossy(&buf[..end]))
}

fn set_binary_value(key: &RegKey, name: &str, data: &[u8]) -> Result<(), CardError> {
    use windows_sys::Win32::System::Registry::{RegSetValueExW, REG_BINARY};
    let wide_name = wide(name);
    let status = unsafe {
        RegSetValueExW(
            key.0,
            wide_name.as_ptr(),
            0,
            REG_BINARY,
            data.as_ptr(),
            data.len() as u32,
        )
    };
    if status != 0 {
        return Err(fail(&format!("RegSetValueExW({name})"), status));
    }
    Ok(())
}

/// DPAPI-encrypts `data` using `entropy` as the optional entropy blob.
fn dpapi_encrypt(data: &[u8], entropy: &[u8]) -> Result<Vec<u8>, CardError> {
    let mut data_blob = CRYPT_INTEGER_BLOB {
        cbData: data.len() as u32,
        pbData: data.as_ptr() as *mut u8,
    };
    let mut entropy_blob = CRYPT_INTEGER_BLOB {
        cbData: entropy.len() as u32,
        pbData: entropy.as_ptr() as *mut u8,
    };
    let mut out_blob = CRYPT_INTEGER_BLOB {
        cbData: 0,
        pbData: std::ptr::null_mut(),
    };

    let ok = unsafe {
        CryptProtectData(
            &mut data_blob,
            std::ptr::null(),
            &mut entropy_blob,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            0,
            &mut out_blob,
        )
    };
    if ok == 0 {
        return Err(CardError::LauncherFailure(
            "CryptProtectData failed".to_string(),
        ));
    }

    let result =
        unsafe { std::slice::from_raw_parts(out_blob.pbData, out_blob.cbData as usize) }.to_vec();
    unsafe {
        LocalFree(out_blob.pbData as isize);
    }
    Ok(result)
}

/// Stores `code` as the `auth-data` registry value for `connection_id`,
/// DPAPI-encrypted with that config key's `entropy` value.
fn store_password(connection_id: &str, code: &str) -> Result<(), CardError> {
    let key = open_key(
        HKEY_CURRENT_USER,
        &format!(r"SOFTWARE\OpenVPN-GUI\configs\{connection_id}"),
        KEY_QUERY_VALUE | KEY_SET_VALUE,
    )?;

    let mut entropy = get_binary_value(&key, "entropy")?;
    // The registry value carries a trailing NUL the source strips before use.
    entropy.pop();

    let utf16_code: Vec<u16> = code.encode_utf16().chain(std::iter::once(0)).collect();
    let mut code_bytes = Vec::with_capacity(utf16_code.len() * 2);
    for unit in &utf16_code {
        code_bytes.extend_from_slice(&unit.to_le_bytes());
    }

    let encrypted = dpapi_encrypt(&code_bytes, &entropy)?;
    set_binary_value(&key, "auth-data", &encrypted)
}

async fn run_gui_command(exe: &str, args: &[&str]) -> Result<(), CardError> {
    let output = Command::new(exe)
        .args(args)
        .output()
        .await
        .map_err(|e| fail(&format!("spawning {exe} {args:?}"), e))?;
    if !output.stderr.is_empty() {
        return Err(CardError::LauncherFailure(
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ));
    }
    Ok(())
}

fn user_home_dir() -> PathBuf {
    let home_drive = std::env::var("HOMEDRIVE").unwrap_or_default();
    let home_path = std::env::var("HOMEPATH").unwrap_or_default();
    let combined = format!("{home_drive}{home_path}");
    if !combined.is_empty() {
        PathBuf::from(combined)
    } else {
        PathBuf::from(std::env::var("USERPROFILE").unwrap_or_default())
    }
}

pub async fn connect(connection_id: &str, code: &str) -> Result<(), CardError> {
    store_password(connection_id, code)?;

    let key = open_key(HKEY_LOCAL_MACHINE, r"SOFTWARE\OpenVPN", KEY_QUERY_VALUE)?;
    let exe_path = get_string_value(&key, "exe_path")?;
    drop(key);

    let openvpn_bin = PathBuf::from(&exe_path)
        .parent()
        .map(PathBuf::from)
        .unwrap_or_default();
    let exe = openvpn_bin.join("openvpn-gui.exe");
    let exe = exe.to_string_lossy().into_owned();
    let log_path = user_home_dir().join("OpenVPN").join("log").join(format!("{connection_id}.log"));

    run_gui_command(&exe, &["--command", "silent_connection", "1"]).await?;
    run_gui_command(&exe, &["--command", "connect", connection_id]).await?;
    run_gui_command(&exe, &["--command", "silent_connection", "1"]).await?;

    // Truncate any stale log from a previous attempt before tailing.
    let _ = tokio::fs::write(&log_path, b"").await;

    let result = tail_log(&log_path).await;
    if result.is_err() {
        let _ = run_gui_command(&exe, &["--command", "disconnect", connection_id]).await;
    }
    result
}

/// Polls `log_path` for new lines until a success or failure marker
/// appears. Handles partial reads (the file is being written
/// concurrently by openvpn-gui) by remembering the last consumed byte
/// offset and re-reading from there rather than assuming a full line is
/// always available.
async fn tail_log(log_path: &std::path::Path) -> Result<(), CardError> {
    let mut offset: u64 = 0;
    loop {
        match tokio::fs::File::open(log_path).await {
            Ok(mut file) => {
                file.seek(std::io::SeekFrom::Start(offset))
                    .await
                    .map_err(|e| fail("seeking openvpn-gui log", e))?;
                let mut reader = BufReader::new(file);
                loop {
                    let mut line = String::new();
                    let read = reader
                        .read_line(&mut line)
                        .await
                        .map_err(|e| fail("reading openvpn-gui log", e))?;
                    if read == 0 || !line.ends_with('\n') {
                        // EOF, or a partial line with no trailing newline
                        // yet: stop for this pass, remember where we were.
                        break;
                    }
                    offset += read as u64;

                    if line.contains("Restart pause")
                        || line.contains("AUTH_FAILED")
                        || line.contains("ERROR")
                    {
                        return Err(CardError::LauncherFailure(line.trim_end().to_string()));
                    }
                    if line.contains("MANAGEMENT") && line.contains("CONNECTED,SUCCESS") {
                        return Ok(());
                    }
                }
            }
            Err(e) => {
                log::debug!("openvpn-gui log not yet available: {e}");
            }
        }
        tokio::time::sleep(LOG_POLL_INTERVAL).await;
    }
}
