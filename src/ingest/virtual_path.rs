//! Mapping an on-device virtual path to a cloud notebook destination.
//!
//! Split on `/`, drop empty segments, then:
//!
//! | segments | notebook | section | page |
//! |---|---|---|---|
//! | 0 | ns("Uncategorized") | "Default" | "Untitled" |
//! | 1 | ns("Uncategorized") | "Default" | s0 |
//! | 2 | ns(s0) | s0 | s1 |
//! | n >= 3 | ns(s0_.._s(n-3)) | s(n-2) | s(n-1) |
//!
//! `ns` prefixes [`NOTEBOOK_PREFIX`] so imported notebooks never collide with
//! ones the user created by hand. Segments that go into a notebook name are
//! sanitized first.

use serde::Serialize;

/// Marker prefixed to every notebook this tool creates.
pub const NOTEBOOK_PREFIX: &str = "Tablet - ";

pub const UNCATEGORIZED: &str = "Uncategorized";
pub const DEFAULT_SECTION: &str = "Default";
pub const UNTITLED_PAGE: &str = "Untitled";

/// Characters the cloud service rejects in notebook names.
const FORBIDDEN: [char; 9] = ['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// Where a page lands in the cloud service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Destination {
    pub notebook: String,
    pub section: String,
    pub page: String,
}

/// Replace every forbidden character with `_`.
pub fn sanitize(segment: &str) -> String {
    segment
        .chars()
        .map(|c| if FORBIDDEN.contains(&c) { '_' } else { c })
        .collect()
}

pub fn namespaced(name: &str) -> String {
    format!("{NOTEBOOK_PREFIX}{name}")
}

pub fn decompose(virtual_path: &str) -> Destination {
    let segments: Vec<&str> = virtual_path.split('/').filter(|s| !s.is_empty()).collect();

    match segments.as_slice() {
        [] => Destination {
            notebook: namespaced(UNCATEGORIZED),
            section: DEFAULT_SECTION.to_string(),
            page: UNTITLED_PAGE.to_string(),
        },
        [page] => Destination {
            notebook: namespaced(UNCATEGORIZED),
            section: DEFAULT_SECTION.to_string(),
            page: page.to_string(),
        },
        [folder, page] => Destination {
            notebook: namespaced(&sanitize(folder)),
            section: folder.to_string(),
            page: page.to_string(),
        },
        [folders @ .., section, page] => {
            let joined = folders
                .iter()
                .map(|s| sanitize(s))
                .collect::<Vec<_>>()
                .join("_");
            Destination {
                notebook: namespaced(&joined),
                section: section.to_string(),
                page: page.to_string(),
            }
        }
    }
}

/// The on-device document a page belongs to: its visible name and the
/// folder path above it, if any.
pub fn document_parts(virtual_path: &str) -> (String, Option<String>) {
    let segments: Vec<&str> = virtual_path.split('/').filter(|s| !s.is_empty()).collect();
    match segments.len() {
        0 | 1 => (UNTITLED_PAGE.to_string(), None),
        2 => (segments[0].to_string(), None),
        n => (segments[n - 2].to_string(), Some(segments[..n - 2].join("/"))),
    }
}
