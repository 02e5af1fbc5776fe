//! On-disk layout helpers for the agent's project and session directories.

use std::path::{Path, PathBuf};

/// Convert an absolute project path to the agent's directory name.
/// e.g., "/home/user/my_app" -> "-home-user-my-app"
///
/// Both `/` and `_` become `-`, so the encoding cannot be reversed.
pub fn encode_project_path(project_path: &str) -> String {
    project_path.replace(['/', '_'], "-")
}

/// `<projects_dir>/<project_encoded>/<session_id>.jsonl`
pub fn session_file_path(projects_dir: &Path, project_encoded: &str, session_id: &str) -> PathBuf {
    projects_dir
        .join(project_encoded)
        .join(format!("{}.jsonl", session_id))
}

/// Last path segment, used as a short project label in the sidebar.
pub fn project_display_name(project_path: &str) -> String {
    project_path
        .rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or(project_path)
        .to_string()
}

/// Session ids are used as file names, so only allow a conservative charset.
pub fn is_safe_session_id(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
