use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// Global flag to control whether to use system-installed binaries from PATH
/// instead of ones shipped beside the daemon executable.
static USE_SYSTEM_DEPS: AtomicBool = AtomicBool::new(false);

pub fn set_use_system_deps(use_system: bool) {
    USE_SYSTEM_DEPS.store(use_system, Ordering::Relaxed);
}

pub fn should_use_system_deps() -> bool {
    USE_SYSTEM_DEPS.load(Ordering::Relaxed)
}

/// Directory holding this daemon's mpv IPC sockets.  It lives under the data
/// dir so a second daemon with its own data dir never sees these sockets.
pub fn mpv_socket_dir() -> PathBuf {
    data_dir().join("run")
}

/// IPC socket for one mpv channel (`stream`, `effect`, `warmup`, ...).
pub fn mpv_socket_path(channel: &str) -> PathBuf {
    mpv_socket_dir().join(format!("tuner-mpv-{}.sock", channel))
}

/// Socket files a previous daemon run may have left behind.
pub fn stale_mpv_sockets() -> Vec<PathBuf> {
    stale_mpv_sockets_in(&mpv_socket_dir())
}

fn stale_mpv_sockets_in(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| is_mpv_socket_name(p))
        .collect()
}

fn is_mpv_socket_name(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with("tuner-mpv-") && n.ends_with(".sock"))
        .unwrap_or(false)
}

pub fn data_dir() -> PathBuf {
    // ~/.local/share/tuner (XDG layout on every unix, macOS included)
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".local")
        .join("share")
        .join("tuner")
}

pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("tuner")
}

pub fn log_file_path() -> PathBuf {
    data_dir().join("daemon.log")
}

/// Best-effort board detection from the device tree / cpuinfo.
pub fn is_raspberry_pi() -> bool {
    if let Ok(model) = std::fs::read_to_string("/proc/device-tree/model") {
        if model.contains("Raspberry Pi") {
            return true;
        }
    }
    std::fs::read_to_string("/proc/cpuinfo")
        .map(|info| info.contains("Raspberry Pi") || info.contains("BCM2"))
        .unwrap_or(false)
}

fn find_beside_exe(names: &[&str]) -> Option<PathBuf> {
    let current_exe = std::env::current_exe().ok()?;
    let dir = current_exe.parent()?;
    for name in names {
        let p = dir.join(name);
        if p.exists() {
            return Some(p);
        }
        let p = dir.join("external").join(name);
        if p.exists() {
            return Some(p);
        }
    }
    None
}

fn find_on_path(names: &[&str]) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        for name in names {
            let p = dir.join(name);
            if p.exists() {
                return Some(p);
            }
        }
    }
    None
}

/// Look up a helper binary: `env_override` first, then beside the exe
/// (unless system deps are forced), then PATH.
fn find_binary(env_override: &str, names: &[&str]) -> Option<PathBuf> {
    if let Ok(path) = std::env::var(env_override) {
        let p = PathBuf::from(path);
        if p.exists() {
            return Some(p);
        }
    }
    if !should_use_system_deps() {
        if let Some(p) = find_beside_exe(names) {
            return Some(p);
        }
    }
    find_on_path(names)
}

pub fn find_mpv_binary() -> Option<PathBuf> {
    find_binary("MPV_PATH", &["mpv"])
}

/// Find yt-dlp, used to resolve on-demand video pages to audio URLs.
pub fn find_yt_dlp_binary() -> Option<PathBuf> {
    find_binary("YT_DLP_PATH", &["yt-dlp"])
}

pub fn find_amixer_binary() -> Option<PathBuf> {
    find_binary("AMIXER_PATH", &["amixer"])
}
