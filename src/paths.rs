//! System paths - resolves well-known folder names (and their Arabic
//! aliases) to real absolute paths, with cloud-synced desktop detection.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Maps spoken folder names to canonical resolved paths.
pub struct SystemPaths {
    home_dir: PathBuf,
    desktop_dir: PathBuf,
    paths_map: HashMap<String, PathBuf>,
}

impl SystemPaths {
    pub fn new() -> Self {
        let home_dir = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        let desktop_dir = Self::detect_desktop(&home_dir);

        let mut paths_map = HashMap::new();

        let downloads = dirs::download_dir().unwrap_or_else(|| home_dir.join("Downloads"));
        let documents = dirs::document_dir().unwrap_or_else(|| home_dir.join("Documents"));
        let pictures = dirs::picture_dir().unwrap_or_else(|| home_dir.join("Pictures"));
        let videos = dirs::video_dir().unwrap_or_else(|| home_dir.join("Videos"));
        let music = dirs::audio_dir().unwrap_or_else(|| home_dir.join("Music"));

        for alias in ["desktop", "سطح المكتب", "المكتب"] {
            paths_map.insert(alias.to_string(), desktop_dir.clone());
        }
        for alias in ["downloads", "download", "التنزيلات", "تنزيلات"] {
            paths_map.insert(alias.to_string(), downloads.clone());
        }
        for alias in ["documents", "document", "المستندات", "مستندات"] {
            paths_map.insert(alias.to_string(), documents.clone());
        }
        for alias in ["pictures", "الصور", "صور"] {
            paths_map.insert(alias.to_string(), pictures.clone());
        }
        for alias in ["videos", "الفيديو", "فيديو"] {
            paths_map.insert(alias.to_string(), videos.clone());
        }
        for alias in ["music", "الموسيقى"] {
            paths_map.insert(alias.to_string(), music.clone());
        }

        Self {
            home_dir,
            desktop_dir,
            paths_map,
        }
    }

    /// Desktop detection order: cloud-synced root from the environment
    /// (OneDrive), then the standard folder, then the Arabic-named folder.
    fn detect_desktop(home: &Path) -> PathBuf {
        let onedrive = std::env::var("OneDrive")
            .or_else(|_| std::env::var("OneDriveConsumer"))
            .ok();

        if let Some(root) = onedrive {
            let synced = PathBuf::from(&root).join("Desktop");
            if synced.exists() {
                return synced;
            }
            let synced_ar = PathBuf::from(&root).join("سطح المكتب");
            if synced_ar.exists() {
                return synced_ar;
            }
        }

        if let Some(desktop) = dirs::desktop_dir() {
            if desktop.exists() {
                return desktop;
            }
        }

        let standard = home.join("Desktop");
        if standard.exists() {
            return standard;
        }

        let arabic = home.join("سطح المكتب");
        if arabic.exists() {
            return arabic;
        }

        standard
    }

    pub fn home(&self) -> &Path {
        &self.home_dir
    }

    pub fn desktop(&self) -> &Path {
        &self.desktop_dir
    }

    /// Look up a single well-known name. Returns None for unknown names.
    pub fn lookup(&self, name: &str) -> Option<PathBuf> {
        self.paths_map.get(&name.trim().to_lowercase()).cloned().or_else(|| {
            // Arabic aliases are stored verbatim; lowercase is a no-op there
            self.paths_map.get(name.trim()).cloned()
        })
    }

    /// Resolve a user-supplied path. The first component may be a known
    /// folder name ("downloads/report.pdf"); absolute paths pass through;
    /// anything else is taken relative to the home directory.
    pub fn resolve(&self, user_path: &str) -> PathBuf {
        let trimmed = user_path.trim();
        if trimmed.is_empty() {
            return self.home_dir.clone();
        }

        let path = Path::new(trimmed);
        if path.is_absolute() {
            return path.to_path_buf();
        }

        let mut components = path.components();
        if let Some(first) = components.next() {
            let first_str = first.as_os_str().to_string_lossy().to_string();
            if let Some(base) = self.lookup(&first_str) {
                let rest: PathBuf = components.collect();
                return if rest.as_os_str().is_empty() {
                    base
                } else {
                    base.join(rest)
                };
            }
        }

        self.home_dir.join(trimmed)
    }

    /// Join a target name under a location name; both sides resolved.
    pub fn resolve_target(&self, target: &str, location: &str) -> PathBuf {
        if Path::new(target).is_absolute() {
            return PathBuf::from(target);
        }
        if location.is_empty() {
            return self.resolve(target);
        }
        self.resolve(location).join(target)
    }
}

impl Default for SystemPaths {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_names_resolve() {
        let paths = SystemPaths::new();
        assert!(paths.lookup("desktop").is_some());
        assert!(paths.lookup("Downloads").is_some());
        assert!(paths.lookup("التنزيلات").is_some());
        assert!(paths.lookup("nowhere-special").is_none());
    }

    #[test]
    fn test_arabic_alias_maps_to_same_path() {
        let paths = SystemPaths::new();
        assert_eq!(paths.lookup("downloads"), paths.lookup("التنزيلات"));
        assert_eq!(paths.lookup("desktop"), paths.lookup("سطح المكتب"));
    }

    #[test]
    fn test_resolve_prefixed_path() {
        let paths = SystemPaths::new();
        let resolved = paths.resolve("downloads/report.pdf");
        assert!(resolved.ends_with("report.pdf"));
        assert!(resolved.starts_with(paths.lookup("downloads").unwrap()));
    }

    #[test]
    fn test_absolute_passes_through() {
        let paths = SystemPaths::new();
        let abs = if cfg!(windows) { "C:\\tmp\\x.txt" } else { "/tmp/x.txt" };
        assert_eq!(paths.resolve(abs), PathBuf::from(abs));
    }

    #[test]
    fn test_resolve_target_under_location() {
        let paths = SystemPaths::new();
        let joined = paths.resolve_target("notes.txt", "desktop");
        assert!(joined.ends_with("notes.txt"));
        assert!(joined.starts_with(paths.desktop()));
    }
}
