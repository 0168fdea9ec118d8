//! Branch structure over the messages of one chat.
//!
//! The tree only stores message ids. The main line and every branch own an
//! independent `Vec<Uuid>`; forking copies the active line, so appending to
//! or rewriting one line never touches another.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{RagError, Result};
use crate::models::Branch;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationTree {
    main: Vec<Uuid>,
    branches: Vec<Branch>,
    /// `None` selects the main line.
    active: Option<Uuid>,
}

impl ConversationTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn main_line(&self) -> &[Uuid] {
        &self.main
    }

    pub fn branches(&self) -> &[Branch] {
        &self.branches
    }

    pub fn active_branch_id(&self) -> Option<Uuid> {
        self.active
    }

    /// Message ids of the line currently selected for display and append.
    pub fn active_line(&self) -> &[Uuid] {
        match self.active.and_then(|id| self.branches.iter().find(|b| b.id == id)) {
            Some(branch) => &branch.message_ids,
            None => &self.main,
        }
    }

    fn active_line_mut(&mut self) -> &mut Vec<Uuid> {
        match self.active {
            Some(id) => match self.branches.iter_mut().find(|b| b.id == id) {
                Some(branch) => &mut branch.message_ids,
                None => &mut self.main,
            },
            None => &mut self.main,
        }
    }

    /// Append to the active line. Returns the branch the message now
    /// belongs to (`None` for main).
    pub fn append(&mut self, message_id: Uuid) -> Option<Uuid> {
        self.active_line_mut().push(message_id);
        self.active
    }

    /// Fork the active line at `source_message_id`, inclusive. The active
    /// line is left unchanged.
    pub fn create_branch(&mut self, source_message_id: Uuid, name: impl Into<String>) -> Result<Branch> {
        let line = self.active_line();
        let pos = line
            .iter()
            .position(|id| *id == source_message_id)
            .ok_or_else(|| {
                RagError::not_found(format!(
                    "message {source_message_id} is not on the active line"
                ))
            })?;

        let branch = Branch {
            id: Uuid::now_v7(),
            parent_message_id: source_message_id,
            name: name.into(),
            message_ids: line[..=pos].to_vec(),
            created_at: Utc::now(),
        };
        self.branches.push(branch.clone());
        Ok(branch)
    }

    /// Select a branch, or the main line with `None`.
    pub fn switch_active(&mut self, branch_id: Option<Uuid>) -> Result<()> {
        if let Some(id) = branch_id {
            if !self.branches.iter().any(|b| b.id == id) {
                return Err(RagError::not_found(format!("branch {id}")));
            }
        }
        self.active = branch_id;
        Ok(())
    }

    /// Number of lines (main and branches) referencing `message_id`.
    pub fn reference_count(&self, message_id: Uuid) -> usize {
        std::iter::once(&self.main)
            .chain(self.branches.iter().map(|b| &b.message_ids))
            .filter(|line| line.contains(&message_id))
            .count()
    }

    /// True when more than one line references the message, so editing it
    /// in place would leak into another line.
    pub fn is_shared(&self, message_id: Uuid) -> bool {
        self.reference_count(message_id) > 1
    }

    /// Swap `old` for `new` in the active line only.
    pub fn replace_in_active(&mut self, old: Uuid, new: Uuid) -> Result<()> {
        let line = self.active_line_mut();
        let slot = line
            .iter_mut()
            .find(|id| **id == old)
            .ok_or_else(|| RagError::not_found(format!("message {old} is not on the active line")))?;
        *slot = new;
        Ok(())
    }

    /// Ids referenced by no line.
    pub fn unreferenced<'a>(&'a self, ids: impl IntoIterator<Item = &'a Uuid> + 'a) -> Vec<Uuid> {
        ids.into_iter()
            .filter(|id| self.reference_count(**id) == 0)
            .copied()
            .collect()
    }
}
