use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::geodesy::Bbox;

/// A declarative map service record. `url_template` may contain the
/// placeholders {latLL}, {lonLL}, {latUR}, {lonUR}, {szWidth}, {szHight};
/// rendering appends the substituted template to `url_base`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapServer {
    pub id: u32,
    pub name: String,
    pub url_base: String,
    pub url_template: String,
    #[serde(default)]
    pub proxy: Option<String>,
}

impl MapServer {
    /// Substitute the bbox (6 decimal places) and pixel size (integers).
    pub fn render(&self, bbox: &Bbox, width: u32, height: u32) -> String {
        let t = self
            .url_template
            .replace("{latLL}", &format!("{:.6}", bbox.lat_ll))
            .replace("{lonLL}", &format!("{:.6}", bbox.lon_ll))
            .replace("{latUR}", &format!("{:.6}", bbox.lat_ur))
            .replace("{lonUR}", &format!("{:.6}", bbox.lon_ur))
            .replace("{szWidth}", &width.to_string())
            .replace("{szHight}", &height.to_string());
        format!("{}{}", self.url_base, t)
    }
}

/// Servers compiled in as defaults; a params file can replace them.
pub fn builtin_servers() -> Vec<MapServer> {
    vec![
        MapServer {
            id: 1,
            name: "ArcGIS World Imagery".to_string(),
            url_base: "https://services.arcgisonline.com".to_string(),
            url_template: "/arcgis/rest/services/World_Imagery/MapServer/export?bbox={lonLL},{latLL},{lonUR},{latUR}&bboxSR=4326&size={szWidth},{szHight}&imageSR=4326&format=png24&f=image".to_string(),
            proxy: None,
        },
        MapServer {
            id: 2,
            name: "USGS Imagery".to_string(),
            url_base: "https://basemap.nationalmap.gov".to_string(),
            url_template: "/arcgis/rest/services/USGSImageryOnly/MapServer/export?bbox={lonLL},{latLL},{lonUR},{latUR}&bboxSR=4326&size={szWidth},{szHight}&imageSR=4326&format=png&f=image".to_string(),
            proxy: None,
        },
    ]
}

/// Load server records from a JSON file, falling back to the builtins when
/// the file is absent or malformed.
pub fn load_servers(path: Option<&Path>) -> Vec<MapServer> {
    let Some(path) = path else {
        return builtin_servers();
    };
    match fs::read_to_string(path) {
        Ok(raw) => match serde_json::from_str::<Vec<MapServer>>(&raw) {
            Ok(servers) if !servers.is_empty() => servers,
            Ok(_) => {
                warn!("server file {} is empty, using builtins", path.display());
                builtin_servers()
            }
            Err(e) => {
                warn!("server file {} unreadable ({e}), using builtins", path.display());
                builtin_servers()
            }
        },
        Err(_) => builtin_servers(),
    }
}

pub fn select(servers: &[MapServer], id: u32) -> Option<&MapServer> {
    servers.iter().find(|s| s.id == id)
}
