//! Gzip tarball helpers.

use std::fs::File;
use std::io;
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

/// Leading bytes of every gzip stream.
pub const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];

/// Returns true if `data` starts with the gzip magic number.
pub fn is_gzip(data: &[u8]) -> bool {
    data.starts_with(&GZIP_MAGIC)
}

/// Extracts a `.tar.gz` file into `dest`.
///
/// Entries that would escape `dest` are rejected by `tar` itself.
pub fn unpack_tar_gz(archive: &Path, dest: &Path) -> io::Result<()> {
    let file = File::open(archive)?;
    let mut tar = tar::Archive::new(GzDecoder::new(file));
    std::fs::create_dir_all(dest)?;
    tar.unpack(dest)
}

/// Builds an in-memory `.tar.gz` from `(name in archive, file on disk)` pairs.
pub fn pack_tar_gz(files: &[(&str, &Path)]) -> io::Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (name, path) in files {
        builder.append_path_with_name(path, name)?;
    }
    builder.into_inner()?.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_is_gzip() {
        assert!(is_gzip(&[0x1F, 0x8B, 0x08]));
        assert!(!is_gzip(&[0x1F]));
        assert!(!is_gzip(b"PK\x03\x04"));
        assert!(!is_gzip(&[]));
    }

    #[test]
    fn test_pack_then_unpack() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("results.sarif");
        std::fs::write(&src, b"{\"runs\":[]}").unwrap();

        let bytes = pack_tar_gz(&[("results.sarif", &src)]).unwrap();
        assert!(is_gzip(&bytes));

        let archive = dir.path().join("out.tgz");
        std::fs::write(&archive, &bytes).unwrap();
        let dest = dir.path().join("unpacked");
        unpack_tar_gz(&archive, &dest).unwrap();

        assert_eq!(
            std::fs::read(dest.join("results.sarif")).unwrap(),
            b"{\"runs\":[]}"
        );
    }

    #[test]
    fn test_unpack_rejects_non_gzip() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("plain.tgz");
        std::fs::write(&archive, b"definitely not gzip").unwrap();

        assert!(unpack_tar_gz(&archive, &dir.path().join("out")).is_err());
    }
}
