//! Context Window Manager (C2).
//!
//! Generalizes the teacher's single-strategy `ContextStrategy` trait
//! (`context_strategy.rs`) into the four-category budget model the runtime
//! needs: a fixed total window split across SYSTEM/CONTEXT/DIALOG/SYSTEM_OUTPUT,
//! with borrowing between categories and salience-ranked contributor assembly.

use crate::penguin::message::{Category, Message};
use crate::penguin::token_counter::TokenCounter;
use std::collections::HashMap;
use std::path::Path;

/// Default category shares of the total context window, expressed as
/// fractions of the total. Overridable via [`CategoryShares::custom`].
#[derive(Debug, Clone, Copy)]
pub struct CategoryShares {
    pub system: f64,
    pub context: f64,
    pub dialog: f64,
    pub system_output: f64,
}

impl Default for CategoryShares {
    fn default() -> Self {
        CategoryShares {
            system: 0.10,
            context: 0.35,
            dialog: 0.50,
            system_output: 0.05,
        }
    }
}

impl CategoryShares {
    pub fn custom(system: f64, context: f64, dialog: f64, system_output: f64) -> Self {
        CategoryShares { system, context, dialog, system_output }
    }

    fn share_of(&self, category: Category) -> f64 {
        match category {
            Category::System => self.system,
            Category::Context => self.context,
            Category::Dialog => self.dialog,
            Category::SystemOutput => self.system_output,
        }
    }
}

/// Per-category token budget. Invariant: `0 <= min <= current <= max`.
#[derive(Debug, Clone, Copy)]
pub struct TokenBudget {
    pub min: usize,
    pub current: usize,
    pub max: usize,
}

impl TokenBudget {
    fn new(max: usize) -> Self {
        TokenBudget { min: 0, current: 0, max }
    }
}

/// Kind of content proposed for inclusion in the CONTEXT category.
///
/// Tie-break priority when ranks are equal: `WorkingFiles > Retrieval >
/// CodebaseMap > ProjectDocs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ContributorKind {
    ProjectDocs,
    CodebaseMap,
    Retrieval,
    WorkingFiles,
}

/// A piece of content competing for inclusion in the assembled CONTEXT budget.
#[derive(Debug, Clone)]
pub struct Contributor {
    pub kind: ContributorKind,
    pub content: String,
    pub weight: f64,
    /// Relevance to the current query/task, in `[0, 1]`.
    pub salience: f64,
    pub token_count: usize,
    pub source_reference: String,
    /// Used to break ties after kind priority (higher is more recent).
    pub recency_rank: u64,
}

impl Contributor {
    /// Score is a pure function of `weight * salience`; this is the primary
    /// ranking key before kind-priority and recency tie-breaks apply.
    fn score(&self) -> f64 {
        self.weight * self.salience
    }
}

/// Notice emitted when [`ContextWindowManager::auto_rebalance`] changes the
/// effective budget, so the owning conversation can surface it to the model.
#[derive(Debug, Clone)]
pub struct RebalanceNotice {
    pub from: Category,
    pub to: Category,
    pub amount: usize,
}

/// Result of [`ContextWindowManager::analyze`].
#[derive(Debug, Clone)]
pub struct Analysis {
    pub per_category_tokens: HashMap<Category, usize>,
    pub total: usize,
}

/// Allocates a fixed total context window across four categories and
/// assembles the per-turn context.
pub struct ContextWindowManager {
    total_max: usize,
    budgets: HashMap<Category, TokenBudget>,
    counter: Box<dyn TokenCounter>,
    model: String,
}

/// Fatal configuration error: a single SYSTEM message alone exceeds the
/// window. Reported up to the Core Orchestrator, never silently truncated.
#[derive(Debug)]
pub struct SystemOverflow {
    pub message_id: String,
    pub tokens: usize,
    pub system_max: usize,
}

impl ContextWindowManager {
    pub fn new(total_max: usize, shares: CategoryShares, counter: Box<dyn TokenCounter>, model: impl Into<String>) -> Self {
        let mut budgets = HashMap::new();
        for category in [Category::System, Category::Context, Category::Dialog, Category::SystemOutput] {
            let max = (total_max as f64 * shares.share_of(category)).floor() as usize;
            budgets.insert(category, TokenBudget::new(max));
        }
        ContextWindowManager { total_max, budgets, counter, model }
    }

    pub fn total_max(&self) -> usize {
        self.total_max
    }

    pub fn budget(&self, category: Category) -> TokenBudget {
        self.budgets[&category]
    }

    /// `analyze(session) -> {per_category_tokens, total}`.
    pub fn analyze(&self, messages: &[Message]) -> Analysis {
        let mut per_category_tokens = HashMap::new();
        for category in [Category::System, Category::Context, Category::Dialog, Category::SystemOutput] {
            per_category_tokens.insert(category, 0usize);
        }
        for msg in messages {
            let tokens = self.counter.count_message(msg, &self.model);
            *per_category_tokens.get_mut(&msg.category).unwrap() += tokens;
        }
        let total = per_category_tokens.values().sum();
        Analysis { per_category_tokens, total }
    }

    /// Checks whether a single SYSTEM message alone would overflow the SYSTEM
    /// budget; callers must surface this as a fatal configuration error.
    pub fn check_system_overflow(&self, messages: &[Message]) -> Option<SystemOverflow> {
        let system_max = self.budgets[&Category::System].max;
        messages
            .iter()
            .filter(|m| m.category == Category::System)
            .map(|m| (m, self.counter.count_message(m, &self.model)))
            .find(|(_, tokens)| *tokens > system_max)
            .map(|(m, tokens)| SystemOverflow {
                message_id: m.id.clone(),
                tokens,
                system_max,
            })
    }

    /// `trim(session) -> session'`.
    ///
    /// Drops messages in reverse chronological order within category,
    /// priority SYSTEM_OUTPUT then DIALOG then CONTEXT; SYSTEM is never
    /// trimmed. The most recent user turn and its direct action_result(s) are
    /// pinned even if they fall in a trimmed category.
    pub fn trim(&self, messages: Vec<Message>) -> Vec<Message> {
        let analysis = self.analyze(&messages);
        if analysis.total <= self.total_max {
            return messages;
        }

        let pinned = pinned_indices(&messages);

        let mut remaining = messages;
        let mut over = analysis.total.saturating_sub(self.total_max);

        for category in [Category::SystemOutput, Category::Dialog, Category::Context] {
            if over == 0 {
                break;
            }
            // Oldest-eligible-first within this category: walk forward, drop
            // until budget holds, skipping anything pinned.
            let mut i = 0;
            while i < remaining.len() && over > 0 {
                if remaining[i].category == category && !pinned.contains(&remaining[i].id) {
                    let tokens = self.counter.count_message(&remaining[i], &self.model);
                    remaining.remove(i);
                    over = over.saturating_sub(tokens);
                    // Don't advance i: the next element has shifted into this slot.
                } else {
                    i += 1;
                }
            }
        }

        remaining
    }

    /// `borrow(from, to, amount) -> ok|denied`.
    ///
    /// Denied if `from.max - amount < from.min`, or if SYSTEM would lend.
    pub fn borrow(&mut self, from: Category, to: Category, amount: usize) -> bool {
        if from == Category::System {
            return false;
        }
        let from_budget = self.budgets[&from];
        if from_budget.max < amount || from_budget.max - amount < from_budget.min {
            return false;
        }
        self.budgets.get_mut(&from).unwrap().max -= amount;
        self.budgets.get_mut(&to).unwrap().max += amount;
        true
    }

    /// When CONTEXT is oversubscribed by an assembly request, attempt to
    /// borrow from DIALOG up to its floor. Returns a notice when the
    /// rebalance actually moved budget.
    pub fn auto_rebalance(&mut self, shortfall: usize) -> Option<RebalanceNotice> {
        let dialog = self.budgets[&Category::Dialog];
        let available = dialog.max.saturating_sub(dialog.min);
        let amount = shortfall.min(available);
        if amount == 0 {
            return None;
        }
        if self.borrow(Category::Dialog, Category::Context, amount) {
            Some(RebalanceNotice { from: Category::Dialog, to: Category::Context, amount })
        } else {
            None
        }
    }

    /// `assemble_context(task, contributors[])`.
    ///
    /// Ranks by `weight * salience`, ties broken by kind priority then
    /// recency, greedily fills the CONTEXT budget. If the top contributor
    /// doesn't fit, retries once via `auto_rebalance`; if it still overflows,
    /// truncates the lowest-ranked contributor's content rather than dropping
    /// it whole.
    pub fn assemble_context(&mut self, mut contributors: Vec<Contributor>) -> Vec<Contributor> {
        contributors.sort_by(|a, b| {
            b.score()
                .partial_cmp(&a.score())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.kind.cmp(&a.kind))
                .then(b.recency_rank.cmp(&a.recency_rank))
        });

        let mut budget_left = self.budgets[&Category::Context].max;
        let mut selected = Vec::new();

        let mut iter = contributors.into_iter().peekable();
        if let Some(first) = iter.peek() {
            if first.token_count > budget_left {
                if let Some(notice) = self.auto_rebalance(first.token_count - budget_left) {
                    budget_left += notice.amount;
                }
            }
        }

        while let Some(mut contributor) = iter.next() {
            if contributor.token_count <= budget_left {
                budget_left -= contributor.token_count;
                selected.push(contributor);
            } else if budget_left > 0 {
                // Truncate rather than drop: keep the highest-fidelity prefix
                // that still fits, by character proportion of the budget.
                let keep_chars = (contributor.content.chars().count() * budget_left)
                    / contributor.token_count.max(1);
                contributor.content = contributor.content.chars().take(keep_chars).collect();
                contributor.token_count = budget_left;
                selected.push(contributor);
                budget_left = 0;
            }
            // else: no budget left, lowest-ranked remaining contributors are dropped.
        }

        selected
    }

    /// `project_docs_autoload(workspace)`.
    ///
    /// Tries PENGUIN.md, AGENTS.md, README.md in priority order; loads the
    /// first found, truncated to `token_cap` (default ≈600), and returns it as
    /// a `ProjectDocs` contributor.
    pub fn project_docs_autoload(&self, workspace: &Path, token_cap: usize) -> Option<Contributor> {
        const CANDIDATES: [&str; 3] = ["PENGUIN.md", "AGENTS.md", "README.md"];
        for name in CANDIDATES {
            let path = workspace.join(name);
            if let Ok(content) = std::fs::read_to_string(&path) {
                let char_cap = token_cap * 4; // heuristic inverse of the counter
                let truncated: String = content.chars().take(char_cap).collect();
                let token_count = self.counter.count_text(&truncated, &self.model);
                return Some(Contributor {
                    kind: ContributorKind::ProjectDocs,
                    content: truncated,
                    weight: 1.0,
                    salience: 1.0,
                    token_count,
                    source_reference: path.display().to_string(),
                    recency_rank: 0,
                });
            }
        }
        None
    }
}

/// Identifies the message ids that must never be trimmed regardless of
/// category: the most recent user turn and any action_result messages that
/// directly follow it.
fn pinned_indices(messages: &[Message]) -> std::collections::HashSet<String> {
    use crate::penguin::message::{MessageType, Role};
    let mut pinned = std::collections::HashSet::new();
    if let Some(last_user_idx) = messages.iter().rposition(|m| m.role == Role::User) {
        pinned.insert(messages[last_user_idx].id.clone());
        for msg in &messages[last_user_idx + 1..] {
            let is_action_result = msg
                .envelope
                .as_ref()
                .map(|e| e.message_type == MessageType::ActionResult)
                .unwrap_or(false);
            if is_action_result {
                pinned.insert(msg.id.clone());
            }
        }
    }
    pinned
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::penguin::message::Role;
    use crate::penguin::token_counter::HeuristicTokenCounter;

    fn cwm(total_max: usize) -> ContextWindowManager {
        ContextWindowManager::new(total_max, CategoryShares::default(), Box::new(HeuristicTokenCounter), "test-model")
    }

    #[test]
    fn shares_split_total_window() {
        let manager = cwm(1000);
        assert_eq!(manager.budget(Category::System).max, 100);
        assert_eq!(manager.budget(Category::Context).max, 350);
        assert_eq!(manager.budget(Category::Dialog).max, 500);
        assert_eq!(manager.budget(Category::SystemOutput).max, 50);
    }

    #[test]
    fn borrow_denied_when_system_is_lender() {
        let mut manager = cwm(1000);
        assert!(!manager.borrow(Category::System, Category::Context, 10));
    }

    #[test]
    fn borrow_denied_below_floor() {
        let mut manager = cwm(1000);
        manager.budgets.get_mut(&Category::Dialog).unwrap().min = 500;
        assert!(!manager.borrow(Category::Dialog, Category::Context, 1));
    }

    #[test]
    fn trim_never_drops_system_messages() {
        let manager = cwm(40); // tiny window to force trimming
        let messages = vec![
            Message::new(Role::System, "you are a helpful agent with a very long system prompt indeed", Category::System, "agent-1"),
            Message::new(Role::User, "hello there, how are you doing today my friend", Category::Dialog, "agent-1"),
        ];
        let trimmed = manager.trim(messages);
        assert!(trimmed.iter().any(|m| m.category == Category::System));
    }

    #[test]
    fn trim_pins_newest_user_turn() {
        let manager = cwm(20);
        let messages = vec![
            Message::new(Role::User, "first old message that should be trimmed away eventually", Category::Dialog, "agent-1"),
            Message::new(Role::User, "second newest user message stays pinned no matter what", Category::Dialog, "agent-1"),
        ];
        let newest_id = messages[1].id.clone();
        let trimmed = manager.trim(messages);
        assert!(trimmed.iter().any(|m| m.id == newest_id));
    }

    #[test]
    fn assemble_context_ranks_by_weight_times_salience() {
        let mut manager = cwm(1000);
        let low = Contributor {
            kind: ContributorKind::ProjectDocs,
            content: "low".into(),
            weight: 1.0,
            salience: 0.1,
            token_count: 10,
            source_reference: "low".into(),
            recency_rank: 0,
        };
        let high = Contributor {
            kind: ContributorKind::Retrieval,
            content: "high".into(),
            weight: 1.0,
            salience: 0.9,
            token_count: 10,
            source_reference: "high".into(),
            recency_rank: 0,
        };
        let selected = manager.assemble_context(vec![low, high]);
        assert_eq!(selected[0].source_reference, "high");
    }

    #[test]
    fn assemble_context_truncates_rather_than_drops_when_overflowing() {
        let mut manager = cwm(100); // CONTEXT budget = 35
        let big = Contributor {
            kind: ContributorKind::Retrieval,
            content: "x".repeat(1000),
            weight: 1.0,
            salience: 1.0,
            token_count: 1000,
            source_reference: "big".into(),
            recency_rank: 0,
        };
        let selected = manager.assemble_context(vec![big]);
        assert_eq!(selected.len(), 1);
        assert!(selected[0].content.len() < 1000);
    }
}
