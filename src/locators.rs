use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::info;

/// Selectors derived once per category from a calibration search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatorSet {
    pub title_selector: String,
    pub price_selector: String,
}

impl LocatorSet {
    /// Turn an element's `class` attribute into a reusable selector:
    /// `"Nx9bqj  _4b5DiR "` becomes `"Nx9bqj._4b5DiR"`.
    pub fn selector_from_class(class: &str) -> String {
        class.split_whitespace().collect::<Vec<_>>().join(".")
    }
}

/// Key-value persistence for locator sets. No expiry.
pub trait LocatorStore: Send + Sync {
    fn load(&self, category: &str) -> io::Result<Option<LocatorSet>>;
    fn save(&self, category: &str, set: &LocatorSet) -> io::Result<()>;
    fn clear(&self, category: &str) -> io::Result<()>;
}

/// One file per category, holding the title and price selectors on two lines.
pub struct FileLocatorStore {
    dir: PathBuf,
}

impl FileLocatorStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, category: &str) -> PathBuf {
        self.dir.join(format!("{category}.txt"))
    }
}

impl LocatorStore for FileLocatorStore {
    fn load(&self, category: &str) -> io::Result<Option<LocatorSet>> {
        let path = self.path_for(category);
        let text = match fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(parse_lines(&text))
    }

    fn save(&self, category: &str, set: &LocatorSet) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(category);
        write_atomic(
            &path,
            &format!("{}\n{}\n", set.title_selector, set.price_selector),
        )?;
        info!(category, path = %path.display(), "Saved locator cache");
        Ok(())
    }

    fn clear(&self, category: &str) -> io::Result<()> {
        match fs::remove_file(self.path_for(category)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

/// A cache file with fewer than two non-empty lines is treated as absent.
fn parse_lines(text: &str) -> Option<LocatorSet> {
    let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
    let title = lines.next()?;
    let price = lines.next()?;
    Some(LocatorSet {
        title_selector: title.to_string(),
        price_selector: price.to_string(),
    })
}

pub(crate) fn write_atomic(path: &Path, contents: &str) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)
}
