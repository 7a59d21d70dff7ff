use std::path::PathBuf;

use directories::ProjectDirs;

const PROJECT_ROOT: &str = env!("CARGO_MANIFEST_DIR");

pub fn asset_dir() -> PathBuf {
    let path = if cfg!(debug_assertions) {
        PathBuf::from(PROJECT_ROOT).join("../../dev_assets")
    } else {
        ProjectDirs::from("dev", "taskloom", "taskloom")
            .expect("OS didn't give us a home directory")
            .data_dir()
            .to_path_buf()
    };

    // Ensure the directory exists
    if !path.exists() {
        std::fs::create_dir_all(&path).expect("Failed to create asset directory");
    }

    path
    // ✔ macOS → ~/Library/Application Support/taskloom
    // ✔ Linux → ~/.local/share/taskloom   (respects XDG_DATA_HOME)
    // ✔ Windows → %APPDATA%\taskloom\taskloom
}

pub fn config_path() -> PathBuf {
    asset_dir().join("config.json")
}

pub fn database_path() -> PathBuf {
    asset_dir().join("db.sqlite")
}

/// Default root under which per-repo worktree directories are created.
/// Not created eagerly; the worktree manager creates it on first use.
pub fn default_worktrees_dir() -> PathBuf {
    asset_dir().join("worktrees")
}
