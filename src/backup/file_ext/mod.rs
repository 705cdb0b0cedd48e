use itertools::Itertools;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub trait FileExtProvider {
    fn file_ext(&self) -> Option<Arc<str>>;
}

/// Joins `base` with every extension the providers contribute, in order.
pub fn join_exts(base: &str, providers: &[&dyn FileExtProvider]) -> String {
    std::iter::once(Arc::<str>::from(base))
        .chain(providers.iter().filter_map(|p| p.file_ext()))
        .join(".")
}

/// `archive.tar` + `gpg` → `archive.tar.gpg`
pub fn append_ext<P: AsRef<Path>>(path: P, ext: &str) -> PathBuf {
    let mut os = path.as_ref().as_os_str().to_os_string();
    os.push(".");
    os.push(ext);
    PathBuf::from(os)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Ext(Option<&'static str>);

    impl FileExtProvider for Ext {
        fn file_ext(&self) -> Option<Arc<str>> {
            self.0.map(Arc::from)
        }
    }

    #[test]
    fn test_join_exts_skips_missing() {
        assert_eq!(join_exts("tar", &[&Ext(Some("zst")), &Ext(None), &Ext(Some("gpg"))]), "tar.zst.gpg");
        assert_eq!(join_exts("sql", &[]), "sql");
    }

    #[test]
    fn test_append_ext() {
        assert_eq!(append_ext("/a/b.tar.xz", "gpg"), PathBuf::from("/a/b.tar.xz.gpg"));
    }
}
