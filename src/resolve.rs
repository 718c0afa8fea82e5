//! Turns a pathname into a `Loc`: a component-by-component walk through the
//! inode table, consulting the brick only for entries not already cached,
//! following symlinks up to a bounded depth, and retrying the whole walk a
//! bounded number of times if a graph switch makes part of it go stale
//! mid-flight.
//!
//! Grounded on `glfs-resolve.c`'s `priv_glfs_resolve_at`/
//! `glfs_resolve_component`/`glfs_resolve_symlink`.

use std::collections::VecDeque;

use log::debug;

use crate::attr::FileType;
use crate::errno::{Errno, Result};
use crate::gfid::{Gfid, NIL_GFID, ROOT_GFID};
use crate::graph::Graph;
use crate::inode::Inode;
use crate::loc::Loc;
use crate::task::TaskRuntime;
use crate::translator::{Operation, OperationReply};
use std::sync::Arc;

/// Symlink resolution gives up rather than looping forever past this
/// depth, matching the bound the source implementation enforces.
pub const SYMLINK_MAX_DEPTH: u32 = 2048;

/// How many times the whole resolution walk is retried from scratch after
/// an `ESTALE`, on the theory that a graph switch invalidated cached state
/// mid-walk and a fresh attempt against the now-settled graph will succeed.
pub const DEFAULT_REVAL_COUNT: u32 = 1;

fn split_components(path: &str) -> VecDeque<String> {
    path.split('/').filter(|s| !s.is_empty()).map(String::from).collect()
}

fn call<T>(rt: &TaskRuntime, fut: impl std::future::Future<Output = Result<Result<T>>> + Send + 'static) -> Result<T>
where
    T: Send + 'static,
{
    rt.syncop(|| async move { fut.await? })
}

fn lookup_remote(graph: &Graph, rt: &TaskRuntime, parent: Gfid, name: &str) -> Result<(Gfid, FileType)> {
    let top = graph.top().clone();
    let name = name.to_string();
    let reply = call(rt, async move { top.forward(Operation::Lookup { parent, name }).recv().await })?;
    match reply {
        OperationReply::Looked { gfid, attr } => Ok((gfid, attr.kind)),
        _ => Err(Errno::Io),
    }
}

fn read_symlink_remote(graph: &Graph, rt: &TaskRuntime, gfid: Gfid) -> Result<String> {
    let top = graph.top().clone();
    let reply = call(rt, async move { top.forward(Operation::Readlink { gfid }).recv().await })?;
    match reply {
        OperationReply::Data(bytes) => String::from_utf8(bytes).map_err(|_| Errno::Invalid),
        _ => Err(Errno::Io),
    }
}

/// Resolves one path component below `parent`: the dentry/inode-table
/// cache if it's warm and doesn't need a fresh lookup, otherwise a brick
/// round trip, linking the result into the inode table either way.
fn resolve_component(graph: &Graph, rt: &TaskRuntime, parent: &Arc<Inode>, name: &str) -> Result<Arc<Inode>> {
    if name == "." {
        return Ok(parent.clone());
    }
    if name == ".." {
        let parent_gfid = parent.parent().unwrap_or(ROOT_GFID);
        return graph.inodes().lookup(&parent_gfid).ok_or(Errno::Stale);
    }

    if let Some(child_gfid) = parent.child(name) {
        if let Some(inode) = graph.inodes().lookup(&child_gfid) {
            if !inode.needs_lookup() {
                return Ok(inode);
            }
        }
    }

    let (gfid, kind) = lookup_remote(graph, rt, parent.gfid(), name)?;
    let inode = graph.inodes().get_or_create(gfid, kind);
    graph.inodes().link(&parent.gfid(), name, &inode);
    inode.clear_needs_lookup();
    Ok(inode)
}

/// Walks `path` (interpreted relative to `start`, whatever directory that
/// is) through the inode table/brick the same way [`resolve_path`] does
/// from the root — exposed to `object.rs` so a symlink target can be
/// re-resolved from the link's own containing directory rather than
/// always from the volume root.
pub(crate) fn walk(graph: &Graph, rt: &TaskRuntime, start: Arc<Inode>, path: &str) -> Result<Arc<Inode>> {
    let mut current = start;
    let mut queue = split_components(path);
    let mut depth = 0u32;

    while let Some(name) = queue.pop_front() {
        let resolved = resolve_component(graph, rt, &current, &name)?;

        if resolved.kind() == FileType::Symlink {
            depth += 1;
            if depth > SYMLINK_MAX_DEPTH {
                return Err(Errno::Loop);
            }
            let target = read_symlink_remote(graph, rt, resolved.gfid())?;
            if let Some(rest) = target.strip_prefix('/') {
                current = graph.inodes().lookup(&ROOT_GFID).ok_or(Errno::Stale)?;
                let mut new_queue = split_components(rest);
                new_queue.extend(queue.drain(..));
                queue = new_queue;
            } else {
                let mut new_queue = split_components(&target);
                new_queue.extend(queue.drain(..));
                queue = new_queue;
                // `current` is unchanged: a relative symlink target is
                // resolved relative to the directory that contains it.
            }
            continue;
        }

        current = resolved;
    }

    Ok(current)
}

/// Resolves an absolute pathname to a `Loc` naming its inode, retrying the
/// whole walk up to [`DEFAULT_REVAL_COUNT`] times if it fails with
/// `ESTALE` partway through.
pub fn resolve_path(graph: &Graph, rt: &TaskRuntime, path: &str) -> Result<Loc> {
    let root = graph.inodes().lookup(&ROOT_GFID).ok_or(Errno::Stale)?;
    if path.is_empty() || path == "/" {
        return Ok(Loc::for_inode(root));
    }

    let mut last_err = Errno::Stale;
    for _ in 0..=DEFAULT_REVAL_COUNT {
        match walk(graph, rt, root.clone(), path) {
            Ok(inode) => return Ok(Loc::for_inode(inode)),
            Err(Errno::Stale) => {
                debug!("resolve {path}: stale handle mid-walk, retrying");
                last_err = Errno::Stale;
                continue;
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err)
}

/// Resolves `path`'s parent directory and returns a `Loc` naming the final
/// component by name, without requiring that component to already exist —
/// the shape `create`/`mkdir`/`symlink`/`mknod` need.
pub fn resolve_parent(graph: &Graph, rt: &TaskRuntime, path: &str) -> Result<Loc> {
    let trimmed = path.trim_end_matches('/');
    let (parent_path, name) = match trimmed.rsplit_once('/') {
        Some((p, n)) if !n.is_empty() => (p, n),
        _ => return Err(Errno::Invalid),
    };
    let parent_loc = resolve_path(graph, rt, parent_path)?;
    let parent_inode = parent_loc.inode.ok_or(Errno::NoEnt)?;
    if parent_inode.kind() != FileType::Directory {
        return Err(Errno::NotDir);
    }

    if let Some(existing_gfid) = parent_inode.child(name) {
        if let Some(existing) = graph.inodes().lookup(&existing_gfid) {
            return Ok(Loc {
                parent: Some(parent_inode),
                name: Some(name.to_string()),
                gfid: existing.gfid(),
                inode: Some(existing),
            });
        }
    }

    Ok(Loc::for_entry(parent_inode, name, NIL_GFID))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;
    use crate::translator::memory_brick::MemoryBrick;
    use crate::translator::Translator;

    fn setup() -> (Arc<Graph>, TaskRuntime) {
        let graph = Graph::new(1, 1, Arc::new(MemoryBrick::new("t")));
        let rt = TaskRuntime::new(2).unwrap();
        (graph, rt)
    }

    fn create_file(graph: &Graph, rt: &TaskRuntime, parent: Gfid, name: &str) -> Gfid {
        let top = graph.top().clone();
        let name = name.to_string();
        let reply = rt
            .syncop(move || async move {
                top.forward(Operation::Create { parent, name, mode: 0o644, gfid_hint: None })
                    .recv()
                    .await?
            })
            .unwrap();
        match reply {
            OperationReply::Looked { gfid, .. } => gfid,
            _ => panic!("unexpected reply"),
        }
    }

    #[test]
    fn root_path_resolves_without_brick_round_trip() {
        let (graph, rt) = setup();
        let loc = resolve_path(&graph, &rt, "/").unwrap();
        assert_eq!(loc.gfid, ROOT_GFID);
    }

    #[test]
    fn single_component_resolves_and_caches() {
        let (graph, rt) = setup();
        let gfid = create_file(&graph, &rt, ROOT_GFID, "a.txt");
        let loc = resolve_path(&graph, &rt, "/a.txt").unwrap();
        assert_eq!(loc.gfid, gfid);
        // Second resolution should hit the dentry cache, not the brick;
        // we can't observe that directly here, but it must still succeed.
        let loc2 = resolve_path(&graph, &rt, "/a.txt").unwrap();
        assert_eq!(loc2.gfid, gfid);
    }

    #[test]
    fn missing_component_is_noent() {
        let (graph, rt) = setup();
        let err = resolve_path(&graph, &rt, "/missing").unwrap_err();
        assert_eq!(err, Errno::NoEnt);
    }

    #[test]
    fn resolve_parent_for_nonexistent_entry() {
        let (graph, rt) = setup();
        let loc = resolve_parent(&graph, &rt, "/new-file.txt").unwrap();
        assert!(loc.inode.is_none());
        assert_eq!(loc.name.as_deref(), Some("new-file.txt"));
        assert_eq!(loc.parent.unwrap().gfid(), ROOT_GFID);
    }

    #[test]
    fn dotdot_from_root_stays_at_root() {
        let (graph, rt) = setup();
        let loc = resolve_path(&graph, &rt, "/..").unwrap();
        assert_eq!(loc.gfid, ROOT_GFID);
    }

    #[test]
    fn symlink_is_followed_to_its_target() {
        let (graph, rt) = setup();
        let target_gfid = create_file(&graph, &rt, ROOT_GFID, "real.txt");
        let top = graph.top().clone();
        rt.syncop(move || async move {
            top.forward(Operation::Symlink {
                parent: ROOT_GFID,
                name: "link.txt".to_string(),
                target: "/real.txt".to_string(),
            })
            .recv()
            .await?
        })
        .unwrap();

        let loc = resolve_path(&graph, &rt, "/link.txt").unwrap();
        assert_eq!(loc.gfid, target_gfid);
    }
}
