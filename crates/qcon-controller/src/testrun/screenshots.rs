//! Screenshot artifacts left by the harness under `tests/<suite>/<language>/<platform>/*.png`.

use std::{
    collections::{BTreeMap, BTreeSet},
    ffi::OsStr,
    path::{Path, PathBuf},
};

use walkdir::WalkDir;

use crate::platform::Platform;

/// Screenshot files per platform. Iteration follows platform enumeration order.
pub type Screenshots = BTreeMap<Platform, BTreeSet<PathBuf>>;

/// Depth of a screenshot below `tests/`: suite, language, platform, file.
const SCREENSHOT_DEPTH: usize = 4;

pub fn scan(base: &Path) -> Screenshots {
    let mut found = Screenshots::new();

    let walker = WalkDir::new(base.join("tests"))
        .min_depth(SCREENSHOT_DEPTH)
        .max_depth(SCREENSHOT_DEPTH)
        .sort_by_file_name();
    for entry in walker.into_iter().filter_map(Result::ok) {
        if entry.file_type().is_dir() {
            continue;
        }
        let path = entry.path();
        if path.extension() != Some(OsStr::new("png")) {
            continue;
        }
        let platform = path
            .parent()
            .and_then(Path::file_name)
            .and_then(OsStr::to_str)
            .and_then(|name| name.parse::<Platform>().ok());
        if let Some(platform) = platform {
            found.entry(platform).or_default().insert(entry.into_path());
        }
    }

    found
}

/// The first platform that gained files between `before` and `after`, with only the new files.
///
/// Later platforms are ignored even if they changed too.
pub fn first_new(before: &Screenshots, after: &Screenshots) -> Option<(Platform, BTreeSet<PathBuf>)> {
    let empty = BTreeSet::new();
    after.iter().find_map(|(platform, files)| {
        let baseline = before.get(platform).unwrap_or(&empty);
        let added: BTreeSet<PathBuf> = files.difference(baseline).cloned().collect();
        (!added.is_empty()).then_some((*platform, added))
    })
}
