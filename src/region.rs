//! Capture regions and the persisted "last region".
//!
//! Regions are rectangles in the compositor's logical coordinate space. The
//! most recent interactive selection is kept on disk so `screenshot last`
//! and the selector's pre-selection restore can reuse it.

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::utils::state_dir;

const LAST_REGION_FILE: &str = "last-region.json";

/// A rectangle in logical coordinates, optionally pinned to an output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl Region {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            output: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    /// Whether the point lies inside the region.
    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.x && x < self.x + self.width && y >= self.y && y < self.y + self.height
    }
}

fn last_region_path() -> Option<PathBuf> {
    Some(state_dir()?.join(LAST_REGION_FILE))
}

/// Loads the persisted last region. Missing or unreadable state yields the
/// empty region.
pub fn load_last_region() -> Region {
    let Some(path) = last_region_path() else {
        return Region::default();
    };

    match fs::read(&path) {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|err| {
            debug!("ignoring malformed last region file: {err}");
            Region::default()
        }),
        Err(_) => Region::default(),
    }
}

/// Persists `region` as the last region.
pub fn save_last_region(region: &Region) -> anyhow::Result<()> {
    use anyhow::Context;

    let path = last_region_path().context("no state directory available")?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("error creating state directory")?;
    }

    let json = serde_json::to_vec(region).context("error serializing region")?;
    fs::write(&path, json).context("error writing last region file")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_when_degenerate() {
        assert!(Region::default().is_empty());
        assert!(Region::new(0, 0, 10, 0).is_empty());
        assert!(Region::new(0, 0, -5, 10).is_empty());
        assert!(!Region::new(5, 5, 1, 1).is_empty());
    }

    #[test]
    fn contains_is_half_open() {
        let r = Region::new(10, 10, 20, 20);
        assert!(r.contains(10, 10));
        assert!(r.contains(29, 29));
        assert!(!r.contains(30, 10));
        assert!(!r.contains(9, 15));
    }

    #[test]
    fn round_trips_through_json() {
        let region = Region {
            x: 100,
            y: 100,
            width: 200,
            height: 300,
            output: Some("DP-1".to_owned()),
        };
        let json = serde_json::to_string(&region).unwrap();
        let back: Region = serde_json::from_str(&json).unwrap();
        assert_eq!(back, region);
    }

    #[test]
    fn output_field_is_optional_on_disk() {
        let back: Region =
            serde_json::from_str(r#"{"x":1,"y":2,"width":3,"height":4}"#).unwrap();
        assert_eq!(back, Region::new(1, 2, 3, 4));
    }

    #[test]
    fn save_then_load_round_trips_on_disk() {
        let dir = std::env::temp_dir().join(format!("dusk-region-test-{}", std::process::id()));
        std::env::set_var("XDG_STATE_HOME", &dir);

        // Missing file reads as the empty region.
        assert!(load_last_region().is_empty());

        let region = Region {
            x: 100,
            y: 100,
            width: 200,
            height: 300,
            output: Some("DP-1".to_owned()),
        };
        save_last_region(&region).unwrap();
        assert_eq!(load_last_region(), region);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
