//! Backward pass driver.

use super::GraphNode;
use crate::Result;
use std::collections::HashSet;
use std::rc::Rc;

/// Runs `backward` on every node reachable from `root`, consumers before producers.
///
/// The topological order is built iteratively so deep graphs (many blocks) do not exhaust the
/// stack. Nodes are identified by their allocation address.
pub fn backward(root: Option<Rc<dyn GraphNode>>) -> Result<()> {
    let Some(root) = root else { return Ok(()) };

    for node in topological_order(root).into_iter().rev() {
        node.backward()?;
    }
    Ok(())
}

/// Post-order DFS: every node appears after all of its parents.
fn topological_order(root: Rc<dyn GraphNode>) -> Vec<Rc<dyn GraphNode>> {
    let mut topo = Vec::new();
    let mut visited: HashSet<*const ()> = HashSet::new();
    let mut stack: Vec<(Rc<dyn GraphNode>, bool)> = vec![(root, false)];

    while let Some((node, expanded)) = stack.pop() {
        let ptr = Rc::as_ptr(&node) as *const ();
        if expanded {
            topo.push(node);
            continue;
        }
        if !visited.insert(ptr) {
            continue;
        }
        let parents = node.parents();
        stack.push((node, true));
        for parent in parents {
            if !visited.contains(&(Rc::as_ptr(&parent) as *const ())) {
                stack.push((parent, false));
            }
        }
    }
    topo
}
