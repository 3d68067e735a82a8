use std::collections::{HashMap, HashSet};
use std::path::{Component, Path};

use percent_encoding::percent_decode_str;
use url::Url;

use crate::config::AssetLayout;
use crate::html_parser::ResourceType;

const MAX_NAME_LEN: usize = 120;

/// Assigns every fetched URL a unique path relative to the output root.
///
/// Allocation is idempotent per URL. Two different URLs never share a path:
/// when the derived name is already taken, `_1`, `_2`, … is inserted before
/// the extension. Names are compared case-insensitively so the mirror stays
/// intact on case-folding filesystems. A path is either a file or a folder,
/// never both.
#[derive(Debug)]
pub struct NameAllocator {
    layout: AssetLayout,
    assets_dir: String,
    assigned: HashMap<Url, String>,
    taken: HashSet<String>,
    /// Every folder prefix handed out so far, lowercased.
    directories: HashSet<String>,
}

impl NameAllocator {
    pub fn new(layout: AssetLayout, assets_dir: &str) -> Self {
        Self {
            layout,
            assets_dir: assets_dir.trim_matches('/').to_string(),
            assigned: HashMap::new(),
            taken: HashSet::new(),
            directories: HashSet::new(),
        }
    }

    pub fn get(&self, url: &Url) -> Option<&str> {
        self.assigned.get(url).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.assigned.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assigned.is_empty()
    }

    pub fn allocate(
        &mut self,
        url: &Url,
        content_type: Option<&str>,
        hint: ResourceType,
    ) -> String {
        if let Some(existing) = self.assigned.get(url) {
            return existing.clone();
        }

        let directory = self.directory_for(url);
        let (stem, extension) = file_name_for(url, content_type, hint);

        let mut candidate = join_name(&directory, &stem, extension.as_deref());
        let mut counter = 1;
        while self.is_occupied(&candidate) {
            let numbered = format!("{stem}_{counter}");
            candidate = join_name(&directory, &numbered, extension.as_deref());
            counter += 1;
        }

        self.taken.insert(candidate.to_lowercase());
        self.assigned.insert(url.clone(), candidate.clone());
        candidate
    }

    fn is_occupied(&self, candidate: &str) -> bool {
        let key = candidate.to_lowercase();
        self.taken.contains(&key) || self.directories.contains(&key)
    }

    /// Folder for `url`, with every prefix reserved. A folder segment that
    /// would land on an existing file gets `_` appended until it is free.
    fn directory_for(&mut self, url: &Url) -> String {
        let mut segments = Vec::new();
        if self.layout == AssetLayout::Mirrored {
            segments.push(origin_folder(url));
            if let Some(path) = url.path_segments() {
                let path: Vec<&str> = path.collect();
                // Everything but the last segment is a folder.
                for segment in &path[..path.len().saturating_sub(1)] {
                    let sanitized = sanitize_segment(&decode(segment));
                    if !sanitized.is_empty() {
                        segments.push(sanitized);
                    }
                }
            }
        }

        let mut directory = self.assets_dir.clone();
        self.directories.insert(directory.to_lowercase());
        for segment in segments {
            let mut next = format!("{directory}/{segment}");
            while self.taken.contains(&next.to_lowercase()) {
                next.push('_');
            }
            directory = next;
            self.directories.insert(directory.to_lowercase());
        }
        directory
    }
}

fn origin_folder(url: &Url) -> String {
    let host = url.host_str().unwrap_or("unknown-host");
    let folder = match url.port() {
        Some(port) => format!("{host}_{port}"),
        None => host.to_string(),
    };
    let folder = sanitize_segment(&folder);
    if folder.is_empty() {
        "unknown-host".to_string()
    } else {
        folder
    }
}

fn join_name(directory: &str, stem: &str, extension: Option<&str>) -> String {
    match extension {
        Some(ext) => format!("{directory}/{stem}.{ext}"),
        None => format!("{directory}/{stem}"),
    }
}

/// Stem and extension for the last path segment of `url`.
fn file_name_for(
    url: &Url,
    content_type: Option<&str>,
    hint: ResourceType,
) -> (String, Option<String>) {
    let last = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .unwrap_or("");
    let name = sanitize_segment(&decode(last));

    let (stem, extension) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => {
            (stem.to_string(), Some(ext.to_string()))
        }
        _ if name.is_empty() => (
            "index".to_string(),
            Some(
                extension_for(content_type, hint)
                    .unwrap_or("html")
                    .to_string(),
            ),
        ),
        _ => (
            name.clone(),
            extension_for(content_type, hint).map(str::to_owned),
        ),
    };

    (truncate(&stem, extension.as_deref()), extension)
}

fn truncate(stem: &str, extension: Option<&str>) -> String {
    let budget = MAX_NAME_LEN.saturating_sub(extension.map_or(0, |e| e.len() + 1));
    if stem.len() <= budget {
        return stem.to_string();
    }
    // Sanitized names are ASCII, so any byte offset is a char boundary.
    stem[..budget].to_string()
}

fn decode(segment: &str) -> String {
    percent_decode_str(segment).decode_utf8_lossy().into_owned()
}

/// Replace everything outside `[A-Za-z0-9._-]` with `_` and strip leading
/// dots, so no name is hidden or climbs out of its folder.
pub fn sanitize_segment(segment: &str) -> String {
    let sanitized: String = segment
        .chars()
        .map(|c| match c {
            c if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' => c,
            _ => '_',
        })
        .collect();
    sanitized.trim_start_matches('.').to_string()
}

/// Preferred file extension for a content type, falling back to the kind of
/// reference that pointed at the asset.
pub fn extension_for(content_type: Option<&str>, hint: ResourceType) -> Option<&'static str> {
    let from_mime = content_type
        .and_then(|value| value.parse::<mime::Mime>().ok())
        .and_then(|parsed| {
            let essence = parsed.essence_str().to_ascii_lowercase();
            preferred_extension(&essence).or_else(|| {
                mime_guess::get_mime_extensions_str(&essence)
                    .and_then(|exts| exts.first().copied())
            })
        });

    from_mime.or(match hint {
        ResourceType::Stylesheet => Some("css"),
        ResourceType::Script => Some("js"),
        ResourceType::Image | ResourceType::Other => None,
    })
}

fn preferred_extension(essence: &str) -> Option<&'static str> {
    let ext = match essence {
        "text/html" | "application/xhtml+xml" => "html",
        "text/css" => "css",
        "text/javascript" | "application/javascript" | "application/x-javascript" => "js",
        "application/json" => "json",
        "application/manifest+json" => "webmanifest",
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/avif" => "avif",
        "image/svg+xml" => "svg",
        "image/x-icon" | "image/vnd.microsoft.icon" => "ico",
        "font/woff" | "application/font-woff" => "woff",
        "font/woff2" => "woff2",
        "font/ttf" | "application/x-font-ttf" => "ttf",
        "font/otf" => "otf",
        "video/mp4" => "mp4",
        "video/webm" => "webm",
        "audio/mpeg" => "mp3",
        "text/plain" => "txt",
        _ => return None,
    };
    Some(ext)
}

/// Reference text for `target` as seen from the file at `from_file`, both
/// relative to the output root.
pub fn relative_to(from_file: &str, target: &str) -> String {
    let from_dir = Path::new(from_file).parent().unwrap_or_else(|| Path::new(""));
    let relative = pathdiff::diff_paths(Path::new(target), from_dir)
        .unwrap_or_else(|| Path::new(target).to_path_buf());

    relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            Component::ParentDir => Some("..".to_string()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_flat_names_from_last_segment() {
        let mut names = NameAllocator::new(AssetLayout::Flat, "assets");
        assert_eq!(
            names.allocate(&url("https://x.test/a.png"), Some("image/png"), ResourceType::Image),
            "assets/a.png"
        );
        assert_eq!(
            names.allocate(&url("https://x.test/deep/dir/app.js?v=3"), None, ResourceType::Script),
            "assets/app.js"
        );
    }

    #[test]
    fn test_collisions_get_numeric_suffix() {
        let mut names = NameAllocator::new(AssetLayout::Flat, "assets");
        let first = url("https://x.test/one/logo.png");
        let second = url("https://cdn.test/two/logo.png");
        let third = url("https://x.test/logo.png?size=2");

        let a = names.allocate(&first, Some("image/png"), ResourceType::Image);
        let b = names.allocate(&second, Some("image/png"), ResourceType::Image);
        let c = names.allocate(&third, Some("image/png"), ResourceType::Image);

        assert_eq!(a, "assets/logo.png");
        assert_eq!(b, "assets/logo_1.png");
        assert_eq!(c, "assets/logo_2.png");

        // Re-querying returns the original allocation.
        assert_eq!(names.allocate(&first, None, ResourceType::Other), a);
        assert_eq!(names.allocate(&second, None, ResourceType::Other), b);
        assert_eq!(names.get(&third), Some(c.as_str()));
        assert_eq!(names.len(), 3);
    }

    #[test]
    fn test_collisions_ignore_case() {
        let mut names = NameAllocator::new(AssetLayout::Flat, "assets");
        let a = names.allocate(&url("https://x.test/Logo.PNG"), None, ResourceType::Image);
        let b = names.allocate(&url("https://x.test/logo.png"), None, ResourceType::Image);
        assert_eq!(a, "assets/Logo.PNG");
        assert_eq!(b, "assets/logo_1.png");
    }

    #[test]
    fn test_directory_like_paths_use_index_and_content_type() {
        let mut names = NameAllocator::new(AssetLayout::Flat, "assets");
        assert_eq!(
            names.allocate(&url("https://x.test/"), Some("text/css; charset=utf-8"), ResourceType::Other),
            "assets/index.css"
        );
        assert_eq!(
            names.allocate(&url("https://x.test/styles/"), None, ResourceType::Stylesheet),
            "assets/index_1.css"
        );
        assert_eq!(
            names.allocate(&url("https://fonts.test/css?family=Roboto"), Some("text/css"), ResourceType::Stylesheet),
            "assets/css.css"
        );
        assert_eq!(
            names.allocate(&url("https://x.test/blob"), None, ResourceType::Other),
            "assets/blob"
        );
    }

    #[test]
    fn test_path_sanitization() {
        let test_cases = vec![
            ("normal-name.css", "normal-name.css"),
            ("name with spaces", "name_with_spaces"),
            ("name?with=query", "name_with_query"),
            ("name#fragment", "name_fragment"),
            ("..hidden", "hidden"),
            ("ünïcode.png", "_n_code.png"),
        ];

        for (input, expected) in test_cases {
            assert_eq!(sanitize_segment(input), expected, "Failed for input: {}", input);
        }
    }

    #[test]
    fn test_percent_encoded_segments_are_decoded_first() {
        let mut names = NameAllocator::new(AssetLayout::Flat, "assets");
        assert_eq!(
            names.allocate(&url("https://x.test/my%20photo.jpg"), None, ResourceType::Image),
            "assets/my_photo.jpg"
        );
    }

    #[test]
    fn test_long_names_are_truncated_keeping_extension() {
        let mut names = NameAllocator::new(AssetLayout::Flat, "assets");
        let long = format!("https://x.test/{}.woff2", "a".repeat(300));
        let path = names.allocate(&url(&long), None, ResourceType::Other);
        let file = path.strip_prefix("assets/").unwrap();
        assert_eq!(file.len(), MAX_NAME_LEN);
        assert!(file.ends_with(".woff2"));
    }

    #[test]
    fn test_mirrored_layout_keeps_remote_structure() {
        let mut names = NameAllocator::new(AssetLayout::Mirrored, "assets");
        assert_eq!(
            names.allocate(&url("https://x.test/css/main.css"), None, ResourceType::Stylesheet),
            "assets/x.test/css/main.css"
        );
        assert_eq!(
            names.allocate(&url("http://127.0.0.1:8080/img/a%20b/bg.png"), None, ResourceType::Image),
            "assets/127.0.0.1_8080/img/a_b/bg.png"
        );
        assert_eq!(
            names.allocate(&url("https://cdn.test/css/main.css"), None, ResourceType::Stylesheet),
            "assets/cdn.test/css/main.css"
        );
        assert_eq!(
            names.allocate(&url("https://x.test/css/main.css?v=2"), None, ResourceType::Stylesheet),
            "assets/x.test/css/main_1.css"
        );
    }

    #[test]
    fn test_dot_only_folders_do_not_collapse_onto_other_files() {
        let mut names = NameAllocator::new(AssetLayout::Mirrored, "assets");
        let dotted = names.allocate(&url("https://x.test/.../a.png"), None, ResourceType::Image);
        let plain = names.allocate(&url("https://x.test/a.png"), None, ResourceType::Image);

        assert_eq!(dotted, "assets/x.test/a.png");
        assert_eq!(plain, "assets/x.test/a_1.png");
        assert!(!dotted.contains("//"));
    }

    #[test]
    fn test_file_and_folder_never_share_a_path() {
        let mut names = NameAllocator::new(AssetLayout::Mirrored, "assets");
        let file = names.allocate(&url("https://x.test/a"), None, ResourceType::Other);
        let nested = names.allocate(&url("https://x.test/a/b.png"), None, ResourceType::Image);
        assert_eq!(file, "assets/x.test/a");
        assert_eq!(nested, "assets/x.test/a_/b.png");

        let mut names = NameAllocator::new(AssetLayout::Mirrored, "assets");
        let nested = names.allocate(&url("https://x.test/a/b.png"), None, ResourceType::Image);
        let file = names.allocate(&url("https://x.test/a"), None, ResourceType::Other);
        assert_eq!(nested, "assets/x.test/a/b.png");
        assert_eq!(file, "assets/x.test/a_1");
    }

    #[test]
    fn test_extension_for_content_types() {
        assert_eq!(extension_for(Some("image/jpeg"), ResourceType::Image), Some("jpg"));
        assert_eq!(extension_for(Some("TEXT/CSS;charset=UTF-8"), ResourceType::Other), Some("css"));
        assert_eq!(extension_for(Some("garbage"), ResourceType::Script), Some("js"));
        assert_eq!(extension_for(None, ResourceType::Image), None);
    }

    #[test]
    fn test_relative_paths() {
        assert_eq!(relative_to("index.html", "assets/a.png"), "assets/a.png");
        assert_eq!(relative_to("assets/main.css", "assets/bg.png"), "bg.png");
        assert_eq!(
            relative_to("assets/x.test/css/main.css", "assets/x.test/img/bg.png"),
            "../img/bg.png"
        );
        assert_eq!(
            relative_to("assets/x.test/css/main.css", "assets/cdn.test/font.woff2"),
            "../../cdn.test/font.woff2"
        );
    }
}
