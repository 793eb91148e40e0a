//! SQLite persistence for projects and their videos.

pub mod db;
pub mod models;

pub use db::{DbHandle, StudioDb};
pub use models::{
    NewProject, NewVideo, Pagination, Project, ProjectDetail, ProjectPage, Video, VideoUpsert,
};
