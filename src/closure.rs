//! Closure computation: the transitive reference set of a store path, in
//! dependency order. The store is a DAG by contract, but the resolver never
//! assumes that — cycles are detected with gray/black coloring and rejected,
//! using an explicit stack rather than unbounded recursion.

use std::collections::HashMap;

use crate::error::SyncError;
use crate::store::StoreBackend;
use crate::store_path::StorePath;

#[derive(Clone, Copy, PartialEq)]
enum Color {
    /// On the current traversal stack.
    Gray,
    /// Fully explored and emitted.
    Black,
}

/// Compute the full closure of `roots`: every path they transitively
/// reference, each exactly once, dependencies before dependents.
/// Read-only; reference queries go to the backend oracle.
pub fn compute_closure(
    backend: &dyn StoreBackend,
    roots: &[StorePath],
) -> Result<Vec<StorePath>, SyncError> {
    let mut colors: HashMap<StorePath, Color> = HashMap::new();
    let mut order: Vec<StorePath> = Vec::new();

    for root in roots {
        if colors.get(root) == Some(&Color::Black) {
            continue;
        }
        colors.insert(root.clone(), Color::Gray);
        let refs = backend.direct_references(root)?;
        let mut stack: Vec<(StorePath, Vec<StorePath>, usize)> = vec![(root.clone(), refs, 0)];

        while !stack.is_empty() {
            let (current, child) = {
                let (path, refs, next) = stack.last_mut().unwrap();
                if *next < refs.len() {
                    let child = refs[*next].clone();
                    *next += 1;
                    (path.clone(), Some(child))
                } else {
                    (path.clone(), None)
                }
            };

            let Some(child) = child else {
                stack.pop();
                colors.insert(current.clone(), Color::Black);
                order.push(current);
                continue;
            };

            // Self-references are legal in the store model and not cycles.
            if child == current {
                continue;
            }
            match colors.get(&child) {
                Some(Color::Black) => {}
                Some(Color::Gray) => {
                    return Err(SyncError::CycleDetected {
                        path: child.render(),
                    });
                }
                None => {
                    colors.insert(child.clone(), Color::Gray);
                    let child_refs = backend.direct_references(&child)?;
                    stack.push((child, child_refs, 0));
                }
            }
        }
    }

    Ok(order)
}
