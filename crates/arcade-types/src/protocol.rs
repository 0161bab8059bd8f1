//! Line-delimited envelopes exchanged with the backend.
//!
//! Every envelope is one JSON object on one line:
//! `{"request_id": 7, "type": "GetGame", "data": "<game id>"}`. Operations without a
//! payload omit `data`.

use crate::{Game, Tag, User};

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Request {
    pub request_id: u32,
    #[serde(flatten)]
    pub body: RequestBody,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum RequestBody {
    Ping,

    GetGameList,
    GetGameListFromFs,
    /// Game id.
    GetGame(String),
    DownloadGame(String),
    DownloadIcon(String),
    DownloadBanner(String),

    GetTagList,
    /// Tag name.
    GetTag(String),
    GetGameListFromTag(String),

    /// User id.
    GetUser(String),

    /// Switches the backend between the production and development catalog.
    SetProduction(bool),

    LaunchGame(String),
    KillGame,
}

impl RequestBody {
    pub fn name(&self) -> &'static str {
        match self {
            RequestBody::Ping => "Ping",
            RequestBody::GetGameList => "GetGameList",
            RequestBody::GetGameListFromFs => "GetGameListFromFs",
            RequestBody::GetGame(_) => "GetGame",
            RequestBody::DownloadGame(_) => "DownloadGame",
            RequestBody::DownloadIcon(_) => "DownloadIcon",
            RequestBody::DownloadBanner(_) => "DownloadBanner",
            RequestBody::GetTagList => "GetTagList",
            RequestBody::GetTag(_) => "GetTag",
            RequestBody::GetGameListFromTag(_) => "GetGameListFromTag",
            RequestBody::GetUser(_) => "GetUser",
            RequestBody::SetProduction(_) => "SetProduction",
            RequestBody::LaunchGame(_) => "LaunchGame",
            RequestBody::KillGame => "KillGame",
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Response {
    pub request_id: u32,
    #[serde(flatten)]
    pub body: ResponseBody,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ResponseBody {
    Pong,
    Ok,
    Err(String),
    GameList(Vec<Game>),
    Game(Game),
    TagList(Vec<Tag>),
    Tag(Tag),
    User(User),
}

impl ResponseBody {
    pub fn kind(&self) -> &'static str {
        match self {
            ResponseBody::Pong => "Pong",
            ResponseBody::Ok => "Ok",
            ResponseBody::Err(_) => "Err",
            ResponseBody::GameList(_) => "GameList",
            ResponseBody::Game(_) => "Game",
            ResponseBody::TagList(_) => "TagList",
            ResponseBody::Tag(_) => "Tag",
            ResponseBody::User(_) => "User",
        }
    }
}

impl Request {
    /// Encodes the request as a single newline-terminated line.
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

impl Response {
    pub fn from_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line.trim_end())
    }

    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}
