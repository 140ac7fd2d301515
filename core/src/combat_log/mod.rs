mod combat_event;
mod error;
mod parser;
mod reader;

pub use combat_event::*;
pub use error::ReaderError;
pub use parser::{EventIter, LogParser};
pub use reader::Reader;

use std::path::Path;

/// Derive the local character name from an `eqlog_<Name>_<Server>.txt`
/// file name. Returns `None` for files that do not follow the EverQuest
/// log naming convention.
pub fn player_name_from_log_path(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    let rest = stem.strip_prefix("eqlog_")?;
    let mut parts = rest.split('_');
    let name = parts.next()?;
    // Server suffix must be present too.
    parts.next()?;
    if name.is_empty() {
        return None;
    }
    Some(name.to_string())
}

#[cfg(test)]
mod logname_tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_player_name_from_log_path() {
        let p = PathBuf::from("/logs/eqlog_Emberval_Imperium_EQ.txt");
        assert_eq!(player_name_from_log_path(&p).as_deref(), Some("Emberval"));
    }

    #[test]
    fn test_player_name_requires_server_suffix() {
        assert_eq!(player_name_from_log_path(Path::new("eqlog_Emberval.txt")), None);
        assert_eq!(player_name_from_log_path(Path::new("combat.txt")), None);
        assert_eq!(player_name_from_log_path(Path::new("eqlog__Imperium.txt")), None);
    }
}
