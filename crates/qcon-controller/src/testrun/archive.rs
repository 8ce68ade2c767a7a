use std::io::Cursor;

use tempfile::TempDir;
use zip::ZipArchive;

use super::{
    screenshots::{self, Screenshots},
    TestRunError,
};

/// Extracts a test archive into a fresh scratch directory and snapshots the screenshots it
/// already contains. Blocking.
///
/// Entries whose names would escape the scratch directory are rejected by the zip reader.
pub(super) fn unpack(archive: &[u8]) -> Result<(TempDir, Screenshots), TestRunError> {
    let mut zip = ZipArchive::new(Cursor::new(archive))?;

    let scratch = tempfile::Builder::new()
        .prefix("qcon-monkey-")
        .tempdir()
        .map_err(TestRunError::Scratch)?;
    zip.extract(scratch.path())?;

    let baseline = screenshots::scan(scratch.path());
    tracing::debug!(
        scratch = %scratch.path().display(),
        entries = zip.len(),
        "extracted test archive"
    );
    Ok((scratch, baseline))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::Platform;
    use std::io::Write;
    use zip::{write::SimpleFileOptions, ZipWriter};

    fn build(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, data) in files {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap().into_inner()
    }

    #[test]
    fn extracts_and_records_baseline() {
        let archive = build(&[
            ("tests/menu/menu.monkey", b"expect screenshot a.png\n"),
            ("tests/menu/english/basalt/a.png", b"png"),
        ]);

        let (scratch, baseline) = unpack(&archive).unwrap();
        assert!(scratch.path().join("tests/menu/menu.monkey").is_file());
        assert_eq!(baseline.len(), 1);
        assert_eq!(baseline[&Platform::Basalt].len(), 1);
    }

    #[test]
    fn garbage_is_a_bad_archive() {
        let err = unpack(b"definitely not a zip").unwrap_err();
        assert!(err.is_bad_archive());
    }
}
