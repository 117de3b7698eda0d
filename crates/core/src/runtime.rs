//! Locating bundled helper binaries and GPU runtime libraries.
//!
//! Worker images ship `ffmpeg` and `libonnxruntime.so` next to the executable
//! rather than on the system search paths; this module finds them there first.

use std::env;
use std::path::{Path, PathBuf};
use std::process::Command as ProcessCommand;

use tracing::{info, warn};

const ORT_LIB_NAME: &str = if cfg!(windows) {
    "onnxruntime.dll"
} else {
    "libonnxruntime.so"
};

/// `<exe_dir>/lib`, `<exe_dir>/../lib`, `<cwd>/lib`, then the system lib dirs.
fn candidate_lib_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(exe_dir) = current_exe_dir() {
        dirs.push(exe_dir.join("lib"));
        if let Some(parent) = exe_dir.parent() {
            dirs.push(parent.join("lib"));
        }
    }
    if let Ok(cwd) = env::current_dir() {
        push_unique(&mut dirs, cwd.join("lib"));
    }
    if cfg!(unix) {
        dirs.push(PathBuf::from("/usr/local/lib"));
        dirs.push(PathBuf::from("/usr/lib"));
    }
    dirs
}

fn candidate_bin_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(exe_dir) = current_exe_dir() {
        dirs.push(exe_dir.join("bin"));
        if let Some(parent) = exe_dir.parent() {
            dirs.push(parent.join("bin"));
        }
        dirs.push(exe_dir);
    }
    if let Ok(cwd) = env::current_dir() {
        push_unique(&mut dirs, cwd.join("bin"));
        push_unique(&mut dirs, cwd);
    }
    dirs
}

fn current_exe_dir() -> Option<PathBuf> {
    let exe = env::current_exe().and_then(|p| p.canonicalize()).ok()?;
    exe.parent().map(Path::to_path_buf)
}

fn push_unique(dirs: &mut Vec<PathBuf>, dir: PathBuf) {
    if !dirs.contains(&dir) {
        dirs.push(dir);
    }
}

fn find_binary_in_dirs(binary: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    let name = if cfg!(windows) && !binary.to_ascii_lowercase().ends_with(".exe") {
        format!("{binary}.exe")
    } else {
        binary.to_string()
    };
    dirs.iter()
        .map(|dir| dir.join(&name))
        .find(|candidate| candidate.is_file())
}

/// A [`ProcessCommand`] for `binary`, preferring a bundled copy over `PATH`.
///
/// Absolute paths are used as given.
pub fn command_for(binary: &str) -> ProcessCommand {
    if Path::new(binary).is_absolute() {
        return ProcessCommand::new(binary);
    }
    match find_binary_in_dirs(binary, &candidate_bin_dirs()) {
        Some(path) => ProcessCommand::new(path),
        None => ProcessCommand::new(binary),
    }
}

fn find_ort_dylib_in_dirs(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(ORT_LIB_NAME))
        .find(|candidate| candidate.is_file())
}

/// Load-priority tier for GPU runtime libs, `None` for anything not preloaded.
///
///   0 CUDA runtime, 1 cuDNN, 2 TensorRT.
///
/// ORT provider libs are skipped: they need symbols from `libonnxruntime.so`,
/// which the ort crate loads later.
fn load_priority(name: &str) -> Option<u8> {
    let name = name.to_ascii_lowercase();
    if name.starts_with("libcudart")
        || name.starts_with("libcublas")
        || name.starts_with("libcufft")
        || name.starts_with("libcurand")
    {
        Some(0)
    } else if name.starts_with("libcudnn") {
        Some(1)
    } else if name.starts_with("libnvinfer") || name.starts_with("libnvonnxparser") {
        Some(2)
    } else {
        None
    }
}

/// Preload GPU libs with `RTLD_GLOBAL` so ORT's later dlopen calls resolve
/// against them. glibc reads `LD_LIBRARY_PATH` only at startup, so setting it
/// from `main` would have no effect.
#[cfg(unix)]
fn preload_libs_from_dirs(dirs: &[PathBuf]) {
    use std::collections::HashSet;

    let mut seen: HashSet<String> = HashSet::new();
    let mut libs: Vec<(u8, String, PathBuf)> = Vec::new();

    for dir in dirs {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.contains(".so") || path.is_symlink() {
                continue;
            }
            let Some(priority) = load_priority(&name) else {
                continue;
            };
            // First directory wins for a given file name.
            if seen.insert(name.clone()) {
                libs.push((priority, name, path));
            }
        }
    }

    libs.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

    for (_, _, lib_path) in &libs {
        // SAFETY: these are vendor GPU runtime libraries whose initializers are
        // safe to run; the handle is leaked so they stay resident.
        unsafe {
            if let Ok(lib) = libloading::os::unix::Library::open(
                Some(lib_path),
                libc::RTLD_LAZY | libc::RTLD_GLOBAL,
            ) {
                std::mem::forget(lib);
            }
        }
    }
}

#[cfg(not(unix))]
fn preload_libs_from_dirs(_dirs: &[PathBuf]) {}

/// Point ORT at a bundled runtime and preload GPU libraries.
///
/// Call at the very start of `main()`, before tracing or any ORT use.
pub fn setup_runtime_libs() {
    let dirs = candidate_lib_dirs();

    if env::var_os("ORT_DYLIB_PATH").is_none() {
        if let Some(path) = find_ort_dylib_in_dirs(&dirs) {
            env::set_var("ORT_DYLIB_PATH", &path);
        }
    }

    preload_libs_from_dirs(&dirs);
}

/// Call after tracing is initialized.
pub fn log_runtime_lib_status() {
    match env::var("ORT_DYLIB_PATH") {
        Ok(ort) if Path::new(&ort).is_file() => info!("ORT library: {ort}"),
        Ok(ort) => warn!("ORT_DYLIB_PATH set to {ort} but file not found"),
        Err(_) => warn!("ORT_DYLIB_PATH not set; ORT will try default search paths"),
    }
}
