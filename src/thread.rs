//! Flat post collection -> depth-annotated reply tree, in display order.

use crate::model::Post;

#[derive(Debug, Clone, PartialEq)]
pub struct ThreadEntry {
    pub post: Post,
    pub depth: usize,
}

/// Orders `posts` for linear rendering with indentation.
///
/// Posts are walked oldest first (stable on equal timestamps). A reply is
/// inserted right after the already placed subtree of its parent, one level
/// deeper. A post whose parent has not been placed yet (deleted, in another
/// channel, or newer than the reply) is appended at depth 0.
pub fn reconstruct(posts: &[Post]) -> Vec<ThreadEntry> {
    let mut ordered: Vec<&Post> = posts.iter().collect();
    ordered.sort_by_key(|post| post.created_at());

    let mut entries: Vec<ThreadEntry> = Vec::with_capacity(ordered.len());
    for post in ordered {
        let (index, depth) = match post.parent() {
            Some(parent) => insertion_point(&entries, parent),
            None => (entries.len(), 0),
        };
        entries.insert(
            index,
            ThreadEntry {
                post: post.clone(),
                depth,
            },
        );
    }
    entries
}

fn insertion_point(entries: &[ThreadEntry], parent: &str) -> (usize, usize) {
    let Some(parent_index) = entries.iter().position(|entry| entry.post.path == parent) else {
        return (entries.len(), 0);
    };
    let depth = entries[parent_index].depth + 1;
    // Stop at the first node shallower than the reply: that ends the parent's subtree.
    let index = entries[parent_index + 1..]
        .iter()
        .position(|entry| entry.depth < depth)
        .map(|offset| parent_index + 1 + offset)
        .unwrap_or(entries.len());
    (index, depth)
}
