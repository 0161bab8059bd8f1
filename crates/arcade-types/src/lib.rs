pub mod protocol;

pub use protocol::{Request, RequestBody, Response, ResponseBody};

/// Stable catalog identifier. Does not change when a game is re-uploaded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct GameId(pub String);

impl std::fmt::Display for GameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for GameId {
    fn from(v: &str) -> Self {
        Self(v.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Tag {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[allow(clippy::upper_case_acronyms)]
pub enum UserType {
    CSH,
    #[default]
    GOOGLE,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct User {
    pub id: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub picture: String,
    pub admin: bool,
    pub user_type: UserType,
}

/// A game record as served by the remote catalog.
///
/// Records are immutable once fetched. Locally downloaded artwork is tracked by the
/// catalog next to the record, not inside it.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Game {
    pub id: GameId,
    pub name: String,
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub tags: Vec<Tag>,
    /// `YYYY-MM-DD`; compares correctly as a string.
    #[serde(default)]
    pub upload_date: String,
    #[serde(default)]
    pub user: User,
}

impl Game {
    pub fn has_tag(&self, name: &str) -> bool {
        self.tags.iter().any(|t| t.name == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum GameStage {
    Absent,
    Downloading,
    Unpacked,
    Containerized,
    Running,
    Exited,
    Failed,
}

impl GameStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            GameStage::Absent => "absent",
            GameStage::Downloading => "downloading",
            GameStage::Unpacked => "unpacked",
            GameStage::Containerized => "containerized",
            GameStage::Running => "running",
            GameStage::Exited => "exited",
            GameStage::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct GameStatus {
    pub game: String,
    pub stage: GameStage,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub message: Option<String>,
}
