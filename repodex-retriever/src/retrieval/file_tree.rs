//! Directory tree reconstruction from the flat list of indexed files.
//!
//! Nodes live in an arena and refer to each other by index. Children are kept in a
//! `BTreeMap` keyed by name, so traversal order only depends on the paths themselves.

use crate::storage::FileRecord;
use std::collections::BTreeMap;
use std::path::{Component, Path};

const ROOT: usize = 0;

#[derive(Debug)]
struct TreeNode<'a> {
    name: String,
    children: BTreeMap<String, usize>,
    file: Option<&'a FileRecord>,
}

impl<'a> TreeNode<'a> {
    fn new(name: String) -> Self {
        Self {
            name,
            children: BTreeMap::new(),
            file: None,
        }
    }
}

/// One line of a depth-first listing
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TreeEntry<'t, 'a> {
    /// Zero for entries directly under the root
    pub depth: usize,
    pub name: &'t str,
    /// `None` for directories
    pub file: Option<&'a FileRecord>,
}

#[derive(Debug)]
pub struct FileTree<'a> {
    nodes: Vec<TreeNode<'a>>,
}

impl<'a> FileTree<'a> {
    /// Build the tree of `records` relative to `root`. Records outside `root` keep their
    /// full path, minus any root or prefix component.
    pub fn from_records(root: &Path, records: &'a [FileRecord]) -> Self {
        let mut tree = Self {
            nodes: vec![TreeNode::new(String::new())],
        };
        for record in records {
            let path = Path::new(&record.file_path);
            let relative = path.strip_prefix(root).unwrap_or(path);
            let names: Vec<String> = relative
                .components()
                .filter_map(|c| match c {
                    Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
                    _ => None,
                })
                .collect();
            if names.is_empty() {
                continue;
            }

            let mut current = ROOT;
            for name in names {
                current = tree.child(current, name);
            }
            tree.nodes[current].file = Some(record);
        }
        tree
    }

    fn child(&mut self, parent: usize, name: String) -> usize {
        if let Some(&index) = self.nodes[parent].children.get(&name) {
            return index;
        }
        let index = self.nodes.len();
        self.nodes.push(TreeNode::new(name.clone()));
        self.nodes[parent].children.insert(name, index);
        index
    }

    /// Number of files in the tree
    pub fn file_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.file.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes[ROOT].children.is_empty()
    }

    /// Depth-first listing, children in name order.
    pub fn entries(&self) -> Vec<TreeEntry<'_, 'a>> {
        let mut entries = Vec::with_capacity(self.nodes.len().saturating_sub(1));
        let mut stack: Vec<(usize, usize)> = self.nodes[ROOT]
            .children
            .values()
            .rev()
            .map(|&index| (index, 0))
            .collect();

        while let Some((index, depth)) = stack.pop() {
            let node = &self.nodes[index];
            entries.push(TreeEntry {
                depth,
                name: &node.name,
                file: node.file,
            });
            stack.extend(node.children.values().rev().map(|&child| (child, depth + 1)));
        }
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FileType;
    use chrono::Utc;

    fn record(id: i64, path: &str) -> FileRecord {
        FileRecord {
            id,
            repository_id: "repo".to_string(),
            file_path: path.to_string(),
            file_type: FileType::Code,
            language: Some("rust".to_string()),
            size_bytes: 10,
            modified_at: 0,
            content_hash: String::new(),
            indexed_at: Utc::now(),
        }
    }

    #[test]
    fn test_depth_first_in_name_order() {
        let records = vec![
            record(1, "/repo/src/main.rs"),
            record(2, "/repo/README.md"),
            record(3, "/repo/src/lib/util.rs"),
            record(4, "/repo/Cargo.toml"),
            record(5, "/repo/src/a.rs"),
        ];
        let tree = FileTree::from_records(Path::new("/repo"), &records);

        let listing: Vec<(usize, &str, Option<i64>)> = tree
            .entries()
            .iter()
            .map(|e| (e.depth, e.name, e.file.map(|f| f.id)))
            .collect();
        assert_eq!(
            listing,
            vec![
                (0, "Cargo.toml", Some(4)),
                (0, "README.md", Some(2)),
                (0, "src", None),
                (1, "a.rs", Some(5)),
                (1, "lib", None),
                (2, "util.rs", Some(3)),
                (1, "main.rs", Some(1)),
            ]
        );
        assert_eq!(tree.file_count(), 5);
    }

    #[test]
    fn test_input_order_does_not_matter() {
        let forward = vec![record(1, "/r/b/x.rs"), record(2, "/r/a.rs")];
        let backward = vec![record(2, "/r/a.rs"), record(1, "/r/b/x.rs")];

        let names = |records: &[FileRecord]| -> Vec<String> {
            FileTree::from_records(Path::new("/r"), records)
                .entries()
                .iter()
                .map(|e| format!("{}{}", "  ".repeat(e.depth), e.name))
                .collect()
        };
        assert_eq!(names(&forward), names(&backward));
    }

    #[test]
    fn test_records_outside_root_keep_full_path() {
        let records = vec![record(1, "/elsewhere/file.txt")];
        let tree = FileTree::from_records(Path::new("/repo"), &records);

        let names: Vec<&str> = tree.entries().iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["elsewhere", "file.txt"]);
    }

    #[test]
    fn test_empty() {
        let tree = FileTree::from_records(Path::new("/repo"), &[]);
        assert!(tree.is_empty());
        assert!(tree.entries().is_empty());
    }
}
