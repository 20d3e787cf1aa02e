use directories::ProjectDirs;

const PROJECT_ROOT: &str = env!("CARGO_MANIFEST_DIR");

pub fn asset_dir() -> std::path::PathBuf {
    let path = if cfg!(debug_assertions) {
        std::path::PathBuf::from(PROJECT_ROOT).join("../../dev_assets")
    } else {
        ProjectDirs::from("app", "whendoist", "whendoist")
            .expect("OS didn't give us a home directory")
            .data_dir()
            .to_path_buf()
    };

    // Ensure the directory exists
    if !path.exists() {
        std::fs::create_dir_all(&path).expect("Failed to create asset directory");
    }

    path
    // ✔ macOS → ~/Library/Application Support/whendoist
    // ✔ Linux → ~/.local/share/whendoist   (respects XDG_DATA_HOME)
    // ✔ Windows → %APPDATA%\whendoist\whendoist
}

pub fn db_path() -> std::path::PathBuf {
    asset_dir().join("whendoist.sqlite")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_path_lives_under_asset_dir() {
        let db = db_path();
        assert_eq!(db, asset_dir().join("whendoist.sqlite"));
    }
}
