use axum::extract::State;
use axum::Json;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::Path;
use walkdir::{DirEntry, WalkDir};

use super::blocking;
use crate::error::ApiError;
use crate::server::AppState;
use crate::workspace::Workspace;

const DEFAULT_MAX_RESULTS: usize = 100;
const MAX_FILE_SIZE: u64 = 1024 * 1024;
const SKIPPED_DIRS: &[&str] = &["node_modules", ".git", "vendor", ".c00d"];

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub is_regex: bool,
    #[serde(default)]
    pub max_results: usize,
    #[serde(default)]
    pub file_glob: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchMatch {
    pub file: String,
    /// 1-based
    pub line: usize,
    pub content: String,
}

/// Compiled form of a search request
pub struct Search {
    pattern: Regex,
    file_glob: Option<glob::Pattern>,
    max_results: usize,
}

impl Search {
    pub fn new(req: &SearchRequest) -> Result<Self, ApiError> {
        if req.query.is_empty() {
            return Err(ApiError::BadRequest("query is required".to_string()));
        }

        let pattern = if req.is_regex {
            Regex::new(&req.query)
                .map_err(|e| ApiError::BadRequest(format!("invalid regex: {}", e)))?
        } else {
            RegexBuilder::new(&regex::escape(&req.query))
                .case_insensitive(true)
                .build()
                .map_err(|e| ApiError::BadRequest(format!("invalid query: {}", e)))?
        };

        let file_glob = if req.file_glob.is_empty() {
            None
        } else {
            Some(
                glob::Pattern::new(&req.file_glob)
                    .map_err(|e| ApiError::BadRequest(format!("invalid file_glob: {}", e)))?,
            )
        };

        Ok(Self {
            pattern,
            file_glob,
            max_results: if req.max_results == 0 {
                DEFAULT_MAX_RESULTS
            } else {
                req.max_results
            },
        })
    }

    /// Walk `start` and collect matching lines, stopping at `max_results`
    pub fn run(&self, ws: &Workspace, start: &Path) -> Vec<SearchMatch> {
        let mut results = Vec::new();

        let walker = WalkDir::new(start)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_skipped(e));

        for entry in walker.filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(glob) = &self.file_glob {
                if !glob.matches(&entry.file_name().to_string_lossy()) {
                    continue;
                }
            }
            match entry.metadata() {
                Ok(m) if m.len() <= MAX_FILE_SIZE => {}
                _ => continue,
            }
            let Ok(bytes) = std::fs::read(entry.path()) else {
                continue;
            };
            let content = String::from_utf8_lossy(&bytes);
            let file = ws
                .relative(entry.path())
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_default();

            for (i, line) in content.split('\n').enumerate() {
                if self.pattern.is_match(line) {
                    results.push(SearchMatch {
                        file: file.clone(),
                        line: i + 1,
                        content: line.trim().to_string(),
                    });
                    if results.len() >= self.max_results {
                        return results;
                    }
                }
            }
        }

        results
    }
}

fn is_skipped(entry: &DirEntry) -> bool {
    let name = entry.file_name().to_string_lossy();
    name.starts_with('.') || (entry.file_type().is_dir() && SKIPPED_DIRS.iter().any(|d| *d == name))
}

/// `POST /api/search`
pub async fn search(
    State(state): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<Value>, ApiError> {
    let search = Search::new(&req)?;
    let start = state.workspace.resolve(&req.path)?;
    let ws = state.workspace.clone();

    let results = blocking(move || search.run(&ws, &start)).await?;
    Ok(Json(json!({ "count": results.len(), "results": results })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn request(query: &str) -> SearchRequest {
        SearchRequest {
            query: query.to_string(),
            path: String::new(),
            is_regex: false,
            max_results: 0,
            file_glob: String::new(),
        }
    }

    fn fixture() -> (TempDir, Workspace) {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("src")).unwrap();
        fs::create_dir_all(root.join("node_modules/pkg")).unwrap();
        fs::create_dir_all(root.join(".c00d")).unwrap();
        fs::write(root.join("src/main.rs"), "fn main() {\n    println!(\"Hello\");\n}\n").unwrap();
        fs::write(root.join("src/notes.txt"), "say hello\nbye\n").unwrap();
        fs::write(root.join("node_modules/pkg/index.js"), "hello").unwrap();
        fs::write(root.join(".c00d/db"), "hello").unwrap();
        fs::write(root.join(".hidden"), "hello").unwrap();
        let ws = Workspace::new(root).unwrap();
        (dir, ws)
    }

    #[test]
    fn test_literal_search_is_case_insensitive() {
        let (_dir, ws) = fixture();
        let search = Search::new(&request("HELLO")).unwrap();
        let mut results = search.run(&ws, ws.root());
        results.sort_by(|a, b| a.file.cmp(&b.file));

        assert_eq!(results.len(), 2);
        assert_eq!(
            results[0],
            SearchMatch {
                file: "src/main.rs".to_string(),
                line: 2,
                content: "println!(\"Hello\");".to_string(),
            }
        );
        assert_eq!(results[1].file, "src/notes.txt");
        assert_eq!(results[1].line, 1);
    }

    #[test]
    fn test_literal_query_escapes_metacharacters() {
        let (_dir, ws) = fixture();
        let results = Search::new(&request("println!(")).unwrap().run(&ws, ws.root());
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn test_regex_and_glob() {
        let (_dir, ws) = fixture();
        let mut req = request(r"^fn \w+");
        req.is_regex = true;
        req.file_glob = "*.rs".to_string();
        let results = Search::new(&req).unwrap().run(&ws, ws.root());
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].content, "fn main() {");

        req.file_glob = "*.txt".to_string();
        assert!(Search::new(&req).unwrap().run(&ws, ws.root()).is_empty());
    }

    #[test]
    fn test_max_results_stops_walk() {
        let dir = TempDir::new().unwrap();
        let body = "match\n".repeat(50);
        fs::write(dir.path().join("a.txt"), &body).unwrap();
        fs::write(dir.path().join("b.txt"), &body).unwrap();
        let ws = Workspace::new(dir.path()).unwrap();

        let mut req = request("match");
        req.max_results = 7;
        assert_eq!(Search::new(&req).unwrap().run(&ws, ws.root()).len(), 7);

        req.max_results = 0;
        assert_eq!(Search::new(&req).unwrap().run(&ws, ws.root()).len(), 100);
    }

    #[test]
    fn test_large_files_skipped() {
        let dir = TempDir::new().unwrap();
        let mut big = "needle\n".to_string();
        big.push_str(&"x".repeat(MAX_FILE_SIZE as usize));
        fs::write(dir.path().join("big.txt"), big).unwrap();
        let ws = Workspace::new(dir.path()).unwrap();
        assert!(Search::new(&request("needle")).unwrap().run(&ws, ws.root()).is_empty());
    }

    #[test]
    fn test_invalid_requests() {
        assert!(matches!(Search::new(&request("")), Err(ApiError::BadRequest(_))));
        let mut req = request("(unclosed");
        req.is_regex = true;
        assert!(matches!(Search::new(&req), Err(ApiError::BadRequest(_))));
    }
}
