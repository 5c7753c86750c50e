//! Output flattening (§4.F): given an `ActionResult`, build a mapping
//! `path -> Output` where each `OutputDirectory` entry is expanded by
//! fetching and recursively flattening its Tree blob.
//!
//! Open Question #1 (spec.md §9): a Tree blob the remote fails to serve is
//! silently skipped — the directory is simply omitted from the result map.
//! That is preserved here; we only add a `warn!` so the omission is at
//! least observable operationally, without changing the return value.

use crate::client::bytestream::ByteStreamClient;
use crate::error::Result;
use crate::merkle::Digest;
use crate::reapi::{Directory, OutputDirectory, Tree};
use crate::retry::RetryEngine;
use prost::Message;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{instrument, warn};

/// One flattened output entry, keyed by its path relative to the action's
/// working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    /// A regular file with its content digest and executable bit.
    File { digest: Digest, is_executable: bool },
    /// A symlink whose target is a file.
    FileSymlink { target: PathBuf },
    /// A symlink whose target is a directory.
    DirectorySymlink { target: PathBuf },
}

pub struct OutputFlattener {
    bytestream: Arc<ByteStreamClient>,
    retry: Arc<RetryEngine>,
}

impl OutputFlattener {
    pub fn new(bytestream: Arc<ByteStreamClient>, retry: Arc<RetryEngine>) -> Self {
        Self { bytestream, retry }
    }

    /// Flatten `action_result`'s outputs into a single `path -> Output` map.
    #[instrument(skip(self, action_result))]
    pub async fn flatten(
        &self,
        action_result: &crate::reapi::ActionResult,
    ) -> Result<HashMap<PathBuf, Output>> {
        let mut out = HashMap::new();

        for file in &action_result.output_files {
            let Some(proto_digest) = &file.digest else {
                continue;
            };
            let digest = Digest::from_proto(proto_digest)?;
            out.insert(
                PathBuf::from(&file.path),
                Output::File {
                    digest,
                    is_executable: file.is_executable,
                },
            );
        }

        for symlink in action_result
            .output_file_symlinks
            .iter()
            .chain(&action_result.output_symlinks)
        {
            out.insert(
                PathBuf::from(&symlink.path),
                Output::FileSymlink {
                    target: PathBuf::from(&symlink.target),
                },
            );
        }

        for symlink in &action_result.output_directory_symlinks {
            out.insert(
                PathBuf::from(&symlink.path),
                Output::DirectorySymlink {
                    target: PathBuf::from(&symlink.target),
                },
            );
        }

        for output_dir in &action_result.output_directories {
            self.flatten_output_directory(output_dir, &mut out).await;
        }

        Ok(out)
    }

    /// Fetch and flatten one `OutputDirectory`'s Tree blob. Failures are
    /// swallowed per the preserved Open Question #1 behavior.
    async fn flatten_output_directory(
        &self,
        output_dir: &OutputDirectory,
        out: &mut HashMap<PathBuf, Output>,
    ) {
        let Some(proto_digest) = &output_dir.tree_digest else {
            return;
        };
        let Ok(tree_digest) = Digest::from_proto(proto_digest) else {
            return;
        };

        let bytestream = self.bytestream.clone();
        let fetch_digest = tree_digest.clone();
        let fetched = self
            .retry
            .execute("fetch tree blob", move || {
                let bytestream = bytestream.clone();
                let digest = fetch_digest.clone();
                async move { bytestream.read_blob(&digest).await }
            })
            .await;

        let bytes = match fetched {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(
                    digest = %tree_digest,
                    path = %output_dir.path,
                    error = %e,
                    "failed to fetch Tree blob for OutputDirectory, omitting from flattened output"
                );
                return;
            }
        };

        let tree = match Tree::decode(bytes.as_slice()) {
            Ok(tree) => tree,
            Err(e) => {
                warn!(
                    digest = %tree_digest,
                    path = %output_dir.path,
                    error = %e,
                    "failed to decode Tree blob for OutputDirectory, omitting from flattened output"
                );
                return;
            }
        };

        let Some(root) = &tree.root else {
            return;
        };

        let digest_to_child: HashMap<Digest, &Directory> = tree
            .children
            .iter()
            .map(|child| (Digest::from_bytes(&child.encode_to_vec()), child))
            .collect();

        flatten_directory(root, &digest_to_child, Path::new(&output_dir.path), out);
    }
}

fn flatten_directory(
    dir: &Directory,
    digest_to_child: &HashMap<Digest, &Directory>,
    prefix: &Path,
    out: &mut HashMap<PathBuf, Output>,
) {
    for file in &dir.files {
        let Some(proto_digest) = &file.digest else {
            continue;
        };
        let Ok(digest) = Digest::from_proto(proto_digest) else {
            continue;
        };
        out.insert(
            prefix.join(&file.name),
            Output::File {
                digest,
                is_executable: file.is_executable,
            },
        );
    }

    for symlink in &dir.symlinks {
        out.insert(
            prefix.join(&symlink.name),
            Output::FileSymlink {
                target: PathBuf::from(&symlink.target),
            },
        );
    }

    for subdir_node in &dir.directories {
        let Some(proto_digest) = &subdir_node.digest else {
            continue;
        };
        let Ok(digest) = Digest::from_proto(proto_digest) else {
            continue;
        };

        if let Some(child) = digest_to_child.get(&digest) {
            flatten_directory(
                child,
                digest_to_child,
                &prefix.join(&subdir_node.name),
                out,
            );
        } else {
            warn!(
                directory = %subdir_node.name,
                "Tree blob missing a referenced child Directory, omitting subtree"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reapi::{DirectoryNode, FileNode, SymlinkNode};

    #[test]
    fn flattens_files_and_symlinks_at_root() {
        let digest = Digest::from_bytes(b"hi");
        let dir = Directory {
            files: vec![FileNode {
                name: "a.txt".into(),
                digest: Some(digest.to_proto()),
                is_executable: true,
                node_properties: None,
            }],
            directories: vec![],
            symlinks: vec![SymlinkNode {
                name: "link".into(),
                target: "/tmp/target".into(),
                node_properties: None,
            }],
            node_properties: None,
        };

        let mut out = HashMap::new();
        flatten_directory(&dir, &HashMap::new(), Path::new("root"), &mut out);

        assert_eq!(
            out.get(Path::new("root/a.txt")),
            Some(&Output::File {
                digest,
                is_executable: true
            })
        );
        assert_eq!(
            out.get(Path::new("root/link")),
            Some(&Output::FileSymlink {
                target: PathBuf::from("/tmp/target")
            })
        );
    }

    #[test]
    fn recurses_into_matched_child_directories() {
        let child_digest_source = Directory {
            files: vec![FileNode {
                name: "nested.txt".into(),
                digest: Some(Digest::from_bytes(b"nested").to_proto()),
                is_executable: false,
                node_properties: None,
            }],
            directories: vec![],
            symlinks: vec![],
            node_properties: None,
        };
        let child_digest = Digest::from_bytes(&child_digest_source.encode_to_vec());

        let root = Directory {
            files: vec![],
            directories: vec![DirectoryNode {
                name: "sub".into(),
                digest: Some(child_digest.to_proto()),
            }],
            symlinks: vec![],
            node_properties: None,
        };

        let mut digest_to_child = HashMap::new();
        digest_to_child.insert(child_digest, &child_digest_source);

        let mut out = HashMap::new();
        flatten_directory(&root, &digest_to_child, Path::new("root"), &mut out);

        assert!(out.contains_key(Path::new("root/sub/nested.txt")));
    }

    #[test]
    fn skips_unresolvable_child_directory_without_error() {
        let missing_digest = Digest::from_bytes(b"never uploaded");
        let root = Directory {
            files: vec![],
            directories: vec![DirectoryNode {
                name: "sub".into(),
                digest: Some(missing_digest.to_proto()),
            }],
            symlinks: vec![],
            node_properties: None,
        };

        let mut out = HashMap::new();
        flatten_directory(&root, &HashMap::new(), Path::new("root"), &mut out);
        assert!(out.is_empty());
    }
}
