//! Pure reverse-tree math used to derive a collective's fan-in/fan-out
//! shape from `(nodeid, nodes, width)`, part of component E's "Tree
//! construction", kept here because the job topology
//! snapshot (component H) needs the same math to derive `parent_id` and
//! `children_cnt` once at step init.

/// `node`'s position in a `width`-ary reverse tree over `nodes` total
/// nodes, numbered breadth-first with node 0 as the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeInfo {
    pub parent_id: Option<u32>,
    pub depth: u32,
    pub max_depth: u32,
}

fn depth_of(node: u32, width: u32) -> u32 {
    if width <= 1 {
        return node;
    }
    let node = node as u64;
    let width = width as u64;
    let mut depth = 0u32;
    let mut start = 0u64;
    let mut span = 1u64;
    loop {
        if node < start + span {
            return depth;
        }
        start += span;
        span = span.saturating_mul(width);
        depth += 1;
    }
}

/// Derive `(parent_id, depth, max_depth)` for `node` in a `width`-ary
/// reverse tree spanning `nodes` total nodes. Node 0 is always the root
/// (`parent_id == None`).
pub fn reverse_tree_info(node: u32, nodes: u32, width: u32) -> TreeInfo {
    let width = width.max(1);
    let parent_id = if node == 0 { None } else { Some((node - 1) / width) };
    let depth = depth_of(node, width);
    let max_depth = if nodes == 0 { 0 } else { depth_of(nodes - 1, width) };
    TreeInfo { parent_id, depth, max_depth }
}

/// Direct children of `node` in a `width`-ary reverse tree spanning `nodes`
/// total nodes, in ascending node-id order.
pub fn reverse_tree_direct_children(node: u32, nodes: u32, width: u32) -> Vec<u32> {
    let width = width.max(1);
    let first = node.saturating_mul(width) + 1;
    if nodes == 0 || first >= nodes {
        return Vec::new();
    }
    let last = (node.saturating_mul(width) + width).min(nodes - 1);
    (first..=last).collect()
}
