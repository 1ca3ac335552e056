//! Win32 adapter.
//!
//! Process enumeration uses a Toolhelp snapshot; deep scans read version
//! resources out of the image file. The shadow store is the per-user
//! registry hive under `Software\FocusLock`. Persistence shells out to
//! `schtasks`, the same surface an interactive administrator would use.

use std::ffi::c_void;
use std::mem;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use rand::RngCore;
use tracing::{debug, warn};
use windows::core::{PCWSTR, PWSTR};
use windows::Win32::Foundation::{
    CloseHandle, GetLastError, LocalFree, ERROR_ALREADY_EXISTS, HANDLE, HLOCAL, LUID,
};
use windows::Win32::Security::Authorization::{
    GetSecurityInfo, SetEntriesInAclW, SetSecurityInfo, EXPLICIT_ACCESS_W, DENY_ACCESS,
    NO_INHERITANCE, NO_MULTIPLE_TRUSTEE, SE_KERNEL_OBJECT, TRUSTEE_IS_SID,
    TRUSTEE_IS_WELL_KNOWN_GROUP, TRUSTEE_W,
};
use windows::Win32::Security::{
    AdjustTokenPrivileges, CreateWellKnownSid, LookupPrivilegeValueW, WinWorldSid, ACL,
    DACL_SECURITY_INFORMATION, LUID_AND_ATTRIBUTES, PSECURITY_DESCRIPTOR, PSID,
    SE_PRIVILEGE_ENABLED, TOKEN_ADJUST_PRIVILEGES, TOKEN_PRIVILEGES, TOKEN_QUERY,
};
use windows::Win32::Storage::FileSystem::{
    GetFileVersionInfoSizeW, GetFileVersionInfoW, VerQueryValueW,
};
use windows::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, Process32FirstW, Process32NextW, PROCESSENTRY32W,
    TH32CS_SNAPPROCESS,
};
use windows::Win32::System::LibraryLoader::{GetModuleHandleW, GetProcAddress};
use windows::Win32::System::Registry::{
    RegCloseKey, RegCreateKeyExW, RegQueryValueExW, RegSetValueExW, HKEY, HKEY_CURRENT_USER,
    KEY_ALL_ACCESS, REG_OPTION_NON_VOLATILE, REG_QWORD, REG_SZ,
};
use windows::Win32::System::Threading::{
    CreateMutexW, GetCurrentProcess, OpenProcess, OpenProcessToken, QueryFullProcessImageNameW,
    TerminateProcess, PROCESS_NAME_WIN32, PROCESS_QUERY_LIMITED_INFORMATION, PROCESS_TERMINATE,
};

use crate::{Error, FileMetadata, OsPlatform, ProcessEntry, Result, ShadowState};

const REGISTRY_PATH: &str = "Software\\FocusLock";
const KEY_SECRET: &str = "SecretKey";
const KEY_LOCK_END: &str = "LockEndTime";
const KEY_REMAINING: &str = "RemainingDuration";
const KEY_PAUSED: &str = "PausedUntil";

pub struct WindowsPlatform;

impl WindowsPlatform {
    pub fn new() -> Self {
        Self
    }
}

impl Default for WindowsPlatform {
    fn default() -> Self {
        Self::new()
    }
}

fn wide(value: &str) -> Vec<u16> {
    value.encode_utf16().chain(std::iter::once(0)).collect()
}

fn from_wide(buffer: &[u16]) -> String {
    let len = buffer.iter().position(|&c| c == 0).unwrap_or(buffer.len());
    String::from_utf16_lossy(&buffer[..len])
}

struct OwnedHandle(HANDLE);

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.0);
        }
    }
}

struct RegKey(HKEY);

impl RegKey {
    /// Open-or-create the FocusLock key in the per-user hive.
    fn open() -> Result<Self> {
        let path = wide(REGISTRY_PATH);
        let mut key = HKEY::default();
        let status = unsafe {
            RegCreateKeyExW(
                HKEY_CURRENT_USER,
                PCWSTR(path.as_ptr()),
                0,
                PCWSTR::null(),
                REG_OPTION_NON_VOLATILE,
                KEY_ALL_ACCESS,
                None,
                &mut key,
                None,
            )
        };
        if status.is_err() {
            return Err(Error::platform(format!("registry open failed: {status:?}")));
        }
        Ok(Self(key))
    }

    fn set_qword(&self, name: &str, value: u64) -> Result<()> {
        let name = wide(name);
        let status = unsafe {
            RegSetValueExW(
                self.0,
                PCWSTR(name.as_ptr()),
                0,
                REG_QWORD,
                Some(&value.to_le_bytes()),
            )
        };
        if status.is_err() {
            return Err(Error::platform(format!("registry write failed: {status:?}")));
        }
        Ok(())
    }

    fn get_qword(&self, name: &str) -> Option<u64> {
        let name = wide(name);
        let mut buffer = [0u8; 8];
        let mut size = buffer.len() as u32;
        let status = unsafe {
            RegQueryValueExW(
                self.0,
                PCWSTR(name.as_ptr()),
                None,
                None,
                Some(buffer.as_mut_ptr()),
                Some(&mut size),
            )
        };
        if status.is_err() || size as usize != buffer.len() {
            return None;
        }
        Some(u64::from_le_bytes(buffer))
    }

    fn set_string(&self, name: &str, value: &str) -> Result<()> {
        let name = wide(name);
        let data = wide(value);
        let bytes = unsafe {
            std::slice::from_raw_parts(data.as_ptr() as *const u8, data.len() * 2)
        };
        let status = unsafe {
            RegSetValueExW(self.0, PCWSTR(name.as_ptr()), 0, REG_SZ, Some(bytes))
        };
        if status.is_err() {
            return Err(Error::platform(format!("registry write failed: {status:?}")));
        }
        Ok(())
    }

    fn get_string(&self, name: &str) -> Option<String> {
        let name = wide(name);
        let mut buffer = [0u16; 256];
        let mut size = (buffer.len() * 2) as u32;
        let status = unsafe {
            RegQueryValueExW(
                self.0,
                PCWSTR(name.as_ptr()),
                None,
                None,
                Some(buffer.as_mut_ptr() as *mut u8),
                Some(&mut size),
            )
        };
        if status.is_err() {
            return None;
        }
        let value = from_wide(&buffer);
        if value.is_empty() {
            None
        } else {
            Some(value)
        }
    }
}

impl Drop for RegKey {
    fn drop(&mut self) {
        unsafe {
            let _ = RegCloseKey(self.0);
        }
    }
}

impl OsPlatform for WindowsPlatform {
    fn process_snapshot(&self) -> Vec<ProcessEntry> {
        let mut entries = Vec::new();
        let snapshot = match unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0) } {
            Ok(handle) => OwnedHandle(handle),
            Err(_) => return entries,
        };

        let mut entry = PROCESSENTRY32W {
            dwSize: mem::size_of::<PROCESSENTRY32W>() as u32,
            ..Default::default()
        };
        if unsafe { Process32FirstW(snapshot.0, &mut entry) }.is_err() {
            return entries;
        }
        loop {
            entries.push(ProcessEntry {
                pid: entry.th32ProcessID,
                exe_name: from_wide(&entry.szExeFile),
            });
            if unsafe { Process32NextW(snapshot.0, &mut entry) }.is_err() {
                break;
            }
        }
        entries
    }

    fn process_image_path(&self, pid: u32) -> Option<PathBuf> {
        let handle = unsafe {
            OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, false, pid)
        }
        .ok()
        .map(OwnedHandle)?;

        let mut buffer = [0u16; 1024];
        let mut size = buffer.len() as u32;
        unsafe {
            QueryFullProcessImageNameW(
                handle.0,
                PROCESS_NAME_WIN32,
                PWSTR(buffer.as_mut_ptr()),
                &mut size,
            )
        }
        .ok()?;
        Some(PathBuf::from(from_wide(&buffer[..size as usize])))
    }

    fn file_metadata(&self, path: &Path) -> Option<FileMetadata> {
        let path = wide(&path.to_string_lossy());
        let mut ignored = 0u32;
        let size = unsafe { GetFileVersionInfoSizeW(PCWSTR(path.as_ptr()), Some(&mut ignored)) };
        if size == 0 {
            return None;
        }

        let mut data = vec![0u8; size as usize];
        unsafe {
            GetFileVersionInfoW(PCWSTR(path.as_ptr()), 0, size, data.as_mut_ptr() as *mut c_void)
        }
        .ok()?;

        // Prefer the file's own translation table, then US English.
        let mut lang_codes: Vec<String> = Vec::new();
        let translation = wide("\\VarFileInfo\\Translation");
        let mut value: *mut c_void = std::ptr::null_mut();
        let mut len = 0u32;
        let found = unsafe {
            VerQueryValueW(
                data.as_ptr() as *const c_void,
                PCWSTR(translation.as_ptr()),
                &mut value,
                &mut len,
            )
        };
        if found.as_bool() && len >= 4 && !value.is_null() {
            let pair = unsafe { *(value as *const [u16; 2]) };
            lang_codes.push(format!("{:04x}{:04x}", pair[0], pair[1]));
        }
        lang_codes.push("040904b0".to_string());

        let query = |key: &str| -> String {
            for code in &lang_codes {
                let sub_block = wide(&format!("\\StringFileInfo\\{code}\\{key}"));
                let mut value: *mut c_void = std::ptr::null_mut();
                let mut len = 0u32;
                let ok = unsafe {
                    VerQueryValueW(
                        data.as_ptr() as *const c_void,
                        PCWSTR(sub_block.as_ptr()),
                        &mut value,
                        &mut len,
                    )
                };
                if ok.as_bool() && len > 0 && !value.is_null() {
                    let slice =
                        unsafe { std::slice::from_raw_parts(value as *const u16, len as usize) };
                    let text = from_wide(slice);
                    if !text.is_empty() {
                        return text;
                    }
                }
            }
            String::new()
        };

        let metadata = FileMetadata {
            product_name: query("ProductName"),
            file_description: query("FileDescription"),
        };
        if metadata.product_name.is_empty() && metadata.file_description.is_empty() {
            None
        } else {
            Some(metadata)
        }
    }

    fn terminate_process(&self, pid: u32) -> Result<()> {
        let handle = unsafe { OpenProcess(PROCESS_TERMINATE, false, pid) }
            .map_err(|err| Error::platform(format!("OpenProcess({pid}) failed: {err}")))?;
        let handle = OwnedHandle(handle);
        unsafe { TerminateProcess(handle.0, 1) }
            .map_err(|err| Error::platform(format!("TerminateProcess({pid}) failed: {err}")))
    }

    fn hosts_path(&self) -> PathBuf {
        let system_root =
            std::env::var("SystemRoot").unwrap_or_else(|_| "C:\\Windows".to_string());
        PathBuf::from(system_root).join("System32").join("drivers").join("etc").join("hosts")
    }

    fn flush_dns_cache(&self) {
        match Command::new("ipconfig").arg("/flushdns").output() {
            Ok(output) if output.status.success() => {}
            Ok(output) => debug!("ipconfig /flushdns exited with {}", output.status),
            Err(err) => debug!("ipconfig unavailable: {err}"),
        }
    }

    fn config_root(&self) -> PathBuf {
        dirs::config_dir().unwrap_or_else(|| PathBuf::from("C:\\ProgramData"))
    }

    fn get_or_create_secret(&self) -> Result<Vec<u8>> {
        let key = RegKey::open()?;
        if let Some(existing) = key.get_string(KEY_SECRET) {
            if let Ok(bytes) = hex::decode(existing.trim()) {
                if bytes.len() == 32 {
                    return Ok(bytes);
                }
            }
            warn!("stored secret unreadable, regenerating");
        }

        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        key.set_string(KEY_SECRET, &hex::encode(bytes))?;
        Ok(bytes.to_vec())
    }

    fn read_shadow(&self) -> Result<ShadowState> {
        let key = RegKey::open()?;
        let lock_end = key
            .get_qword(KEY_LOCK_END)
            .ok_or_else(|| Error::platform("shadow has no lock state"))?;
        Ok(ShadowState {
            lock_end_unix: lock_end,
            remaining_nanos: key.get_qword(KEY_REMAINING).unwrap_or(0),
            paused_until_unix: key.get_qword(KEY_PAUSED).unwrap_or(0),
        })
    }

    fn write_shadow(&self, state: &ShadowState) -> Result<()> {
        let key = RegKey::open()?;
        key.set_qword(KEY_LOCK_END, state.lock_end_unix)?;
        key.set_qword(KEY_REMAINING, state.remaining_nanos)?;
        key.set_qword(KEY_PAUSED, state.paused_until_unix)
    }

    fn acquire_instance_lock(&self, name: &str) -> Result<bool> {
        let name = wide(&format!("Global\\{name}"));
        let handle = unsafe { CreateMutexW(None, true, PCWSTR(name.as_ptr())) }
            .map_err(|err| Error::platform(format!("CreateMutex failed: {err}")))?;
        if unsafe { GetLastError() } == ERROR_ALREADY_EXISTS {
            unsafe {
                let _ = CloseHandle(handle);
            }
            return Ok(false);
        }
        // The handle is deliberately never closed; the mutex must stay
        // held until process exit.
        Ok(true)
    }

    fn register_logon_task(&self, task_name: &str, exe: &Path) -> Result<()> {
        let command = format!("\"{}\" --enforce", exe.display());
        run_quiet(
            "schtasks",
            &[
                "/create", "/tn", task_name, "/tr", &command, "/sc", "ONLOGON", "/rl", "HIGHEST",
                "/f",
            ],
        )
    }

    fn delete_logon_task(&self, task_name: &str) -> Result<()> {
        run_quiet("schtasks", &["/delete", "/tn", task_name, "/f"])
    }

    fn run_logon_task(&self, task_name: &str) -> Result<()> {
        run_quiet("schtasks", &["/run", "/tn", task_name])
    }

    fn spawn_detached(&self, exe: &Path) -> Result<()> {
        use std::os::windows::process::CommandExt;
        // CREATE_NO_WINDOW | CREATE_NEW_PROCESS_GROUP | DETACHED_PROCESS
        const FLAGS: u32 = 0x0800_0000 | 0x0000_0200 | 0x0000_0008;
        Command::new(exe)
            .arg("--enforce")
            .creation_flags(FLAGS)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        Ok(())
    }

    fn enable_debug_privilege(&self) -> Result<()> {
        unsafe {
            let mut token = HANDLE::default();
            OpenProcessToken(
                GetCurrentProcess(),
                TOKEN_ADJUST_PRIVILEGES | TOKEN_QUERY,
                &mut token,
            )
            .map_err(|err| Error::privilege(format!("OpenProcessToken failed: {err}")))?;
            let token = OwnedHandle(token);

            let name = wide("SeDebugPrivilege");
            let mut luid = LUID::default();
            LookupPrivilegeValueW(PCWSTR::null(), PCWSTR(name.as_ptr()), &mut luid)
                .map_err(|err| Error::privilege(format!("LookupPrivilegeValue failed: {err}")))?;

            let privileges = TOKEN_PRIVILEGES {
                PrivilegeCount: 1,
                Privileges: [LUID_AND_ATTRIBUTES {
                    Luid: luid,
                    Attributes: SE_PRIVILEGE_ENABLED,
                }],
            };
            AdjustTokenPrivileges(
                token.0,
                false,
                Some(&privileges as *const TOKEN_PRIVILEGES),
                0,
                None,
                None,
            )
            .map_err(|err| Error::privilege(format!("AdjustTokenPrivileges failed: {err}")))
        }
    }

    fn deny_process_terminate(&self) -> Result<()> {
        unsafe {
            let process = GetCurrentProcess();

            let mut dacl: *mut ACL = std::ptr::null_mut();
            let mut descriptor = PSECURITY_DESCRIPTOR::default();
            let status = GetSecurityInfo(
                process,
                SE_KERNEL_OBJECT,
                DACL_SECURITY_INFORMATION,
                None,
                None,
                Some(&mut dacl as *mut *mut ACL),
                None,
                Some(&mut descriptor as *mut PSECURITY_DESCRIPTOR),
            );
            if status.is_err() {
                return Err(Error::privilege(format!("GetSecurityInfo failed: {status:?}")));
            }
            let _descriptor_guard = DescriptorGuard(descriptor);

            let mut sid_buffer = vec![0u8; 68];
            let mut sid_size = sid_buffer.len() as u32;
            let sid = PSID(sid_buffer.as_mut_ptr() as *mut c_void);
            CreateWellKnownSid(WinWorldSid, None, sid, &mut sid_size)
                .map_err(|err| Error::privilege(format!("CreateWellKnownSid failed: {err}")))?;

            let entry = EXPLICIT_ACCESS_W {
                grfAccessPermissions: PROCESS_TERMINATE.0,
                grfAccessMode: DENY_ACCESS,
                grfInheritance: NO_INHERITANCE,
                Trustee: TRUSTEE_W {
                    pMultipleTrustee: std::ptr::null_mut(),
                    MultipleTrusteeOperation: NO_MULTIPLE_TRUSTEE,
                    TrusteeForm: TRUSTEE_IS_SID,
                    TrusteeType: TRUSTEE_IS_WELL_KNOWN_GROUP,
                    ptstrName: PWSTR(sid.0 as *mut u16),
                },
            };

            let mut new_dacl: *mut ACL = std::ptr::null_mut();
            let status = SetEntriesInAclW(Some(&[entry]), Some(dacl as *const ACL), &mut new_dacl);
            if status.is_err() || new_dacl.is_null() {
                return Err(Error::privilege(format!("SetEntriesInAcl failed: {status:?}")));
            }
            let _dacl_guard = LocalGuard(new_dacl as *mut c_void);

            let status = SetSecurityInfo(
                process,
                SE_KERNEL_OBJECT,
                DACL_SECURITY_INFORMATION,
                None,
                None,
                Some(new_dacl as *const ACL),
                None,
            );
            if status.is_err() {
                return Err(Error::privilege(format!("SetSecurityInfo failed: {status:?}")));
            }
        }
        Ok(())
    }

    fn set_process_critical(&self, enabled: bool) -> Result<()> {
        // RtlSetProcessIsCritical is undocumented; resolve it at runtime.
        type RtlSetProcessIsCritical =
            unsafe extern "system" fn(new_value: u8, old_value: *mut u8, check_flag: u8) -> i32;

        unsafe {
            let ntdll_name = wide("ntdll.dll");
            let ntdll = GetModuleHandleW(PCWSTR(ntdll_name.as_ptr()))
                .map_err(|err| Error::privilege(format!("ntdll unavailable: {err}")))?;
            let proc = GetProcAddress(ntdll, windows::core::s!("RtlSetProcessIsCritical"))
                .ok_or_else(|| Error::privilege("RtlSetProcessIsCritical not found"))?;
            let set_critical: RtlSetProcessIsCritical = mem::transmute(proc);

            let status = set_critical(u8::from(enabled), std::ptr::null_mut(), 0);
            if status != 0 {
                return Err(Error::privilege(format!(
                    "RtlSetProcessIsCritical failed with NTSTATUS 0x{status:x}"
                )));
            }
        }
        Ok(())
    }
}

struct DescriptorGuard(PSECURITY_DESCRIPTOR);

impl Drop for DescriptorGuard {
    fn drop(&mut self) {
        if !self.0 .0.is_null() {
            unsafe {
                let _ = LocalFree(HLOCAL(self.0 .0 as isize));
            }
        }
    }
}

struct LocalGuard(*mut c_void);

impl Drop for LocalGuard {
    fn drop(&mut self) {
        if !self.0.is_null() {
            unsafe {
                let _ = LocalFree(HLOCAL(self.0 as isize));
            }
        }
    }
}

fn run_quiet(program: &str, args: &[&str]) -> Result<()> {
    let output = Command::new(program).args(args).output()?;
    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(Error::platform(format!(
            "{program} {} failed: {}",
            args.join(" "),
            stderr.trim()
        )))
    }
}
