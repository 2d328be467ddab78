//! Server, room, character, music and role configuration.
//!
//! The rest of the server only ever sees these structs as immutable values;
//! reading them off disk happens here and in `main` only.

use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub name: String,
    #[serde(rename = "server_username")]
    pub username: String,
    pub description: String,
    pub max_players: i32,
    pub ws_port: u16,
    pub legacy_port: u16,
    pub control_port: u16,
    pub asset_url: String,
    pub manager_role: String,
    pub max_msg_size: usize,
    pub max_name_size: usize,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "Unnamed Server".to_string(),
            username: "SCS".to_string(),
            description: "An unconfigured SpriteChat server.".to_string(),
            max_players: 100,
            ws_port: 8080,
            legacy_port: 8081,
            control_port: 8082,
            asset_url: String::new(),
            manager_role: "Manager".to_string(),
            max_msg_size: 150,
            max_name_size: 20,
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoomConfig {
    pub name: String,
    pub background: String,
    pub description: String,
    pub ambiance: String,
    pub background_locked: bool,
    pub ambiance_locked: bool,
    pub adjacent_rooms: Vec<String>,
    pub character_lists: Vec<String>,
    pub song_categories: Vec<String>,
    pub sides: Vec<String>,
    pub allow_blankpost: bool,
    pub allow_shouting: bool,
    pub allow_iniswap: bool,
    pub allow_managers: bool,
    pub force_immediate: bool,
    pub log_debug: bool,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            name: "Unknown".to_string(),
            background: "default".to_string(),
            description: String::new(),
            ambiance: String::new(),
            background_locked: false,
            ambiance_locked: false,
            adjacent_rooms: Vec::new(),
            character_lists: vec!["all".to_string()],
            song_categories: vec!["all".to_string()],
            sides: vec!["def".to_string(), "pro".to_string(), "wit".to_string()],
            allow_blankpost: true,
            allow_shouting: true,
            allow_iniswap: true,
            allow_managers: true,
            force_immediate: false,
            log_debug: false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoomList {
    #[serde(default, rename = "room")]
    pub rooms: Vec<RoomConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CharList {
    pub name: String,
    #[serde(default)]
    pub characters: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Characters {
    #[serde(default, rename = "list")]
    pub lists: Vec<CharList>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SongCategory {
    pub name: String,
    #[serde(default)]
    pub songs: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Music {
    #[serde(default, rename = "category")]
    pub categories: Vec<SongCategory>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoleConfig {
    pub name: String,
    /// Permission names; a `^` prefix subtracts instead of adding.
    #[serde(default)]
    pub permissions: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Roles {
    #[serde(default, rename = "role")]
    pub roles: Vec<RoleConfig>,
}

/// Everything the server needs, bundled.
#[derive(Debug, Clone, Default)]
pub struct Bundle {
    pub server: ServerConfig,
    pub rooms: RoomList,
    pub characters: Characters,
    pub music: Music,
    pub roles: Roles,
}

/// Load the whole configuration from a directory of TOML files.
pub fn load(dir: &Path) -> anyhow::Result<Bundle> {
    Ok(Bundle {
        server: load_file(&dir.join("config.toml"))?,
        rooms: load_file(&dir.join("rooms.toml"))?,
        characters: load_file(&dir.join("characters.toml"))?,
        music: load_file(&dir.join("music.toml"))?,
        roles: load_file(&dir.join("roles.toml"))?,
    })
}

fn load_file<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("read config file {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parse config file {}", path.display()))
}
