use crate::{ChangeSet, Snapshot};

/// Diffs the stored snapshot against the freshly normalized one.
///
/// Ids only in `new` are inserted, ids only in `old` are deleted, and ids on
/// both sides are replaced with the `new` document when their compared fields
/// differ. Output order follows ascending id.
pub fn reconcile(old: &Snapshot, new: &Snapshot) -> ChangeSet {
    let mut changes = ChangeSet::default();

    for id in old.ids() {
        if !new.contains(id) {
            changes.to_delete.push(id);
        }
    }

    for doc in new.iter() {
        match old.get(doc.id) {
            None => changes.to_insert.push(doc.clone()),
            Some(stored) if stored.same_content(doc) => {
                changes.unchanged.insert(doc.id);
            }
            Some(_) => changes.to_replace.push(doc.clone()),
        }
    }

    changes
}
