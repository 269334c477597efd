//! Backwards pagination over persisted history

use eddy_wire::Page;

use crate::reconciler::StreamReconciler;

/// A page request produced by [`HistoryPager::next_request`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    /// Fetch messages older than this id; `None` fetches the newest page
    pub before: Option<String>,
    pub limit: usize,
}

/// Tracks the oldest loaded message and keeps at most one fetch in flight
#[derive(Debug)]
pub struct HistoryPager {
    page_size: usize,
    oldest: Option<String>,
    has_more: bool,
    in_flight: bool,
}

impl HistoryPager {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size: page_size.max(1),
            oldest: None,
            has_more: true,
            in_flight: false,
        }
    }

    /// Oldest message loaded from persistence
    pub fn oldest(&self) -> Option<&str> {
        self.oldest.as_deref()
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn is_loading(&self) -> bool {
        self.in_flight
    }

    /// The next request to issue, or `None` if one is in flight or history
    /// is exhausted
    pub fn next_request(&mut self) -> Option<PageRequest> {
        if self.in_flight || !self.has_more {
            return None;
        }
        self.in_flight = true;
        Some(PageRequest {
            before: self.oldest.clone(),
            limit: self.page_size,
        })
    }

    /// Prepend a fetched page. Returns the id of the message that was first
    /// before the prepend, for viewport restoration.
    pub fn apply_page(&mut self, reconciler: &mut StreamReconciler, page: Page) -> Option<String> {
        self.in_flight = false;
        if let Some(first) = page.messages.first() {
            self.oldest = Some(first.id.clone());
        }
        self.has_more = page.has_more && !page.messages.is_empty();
        tracing::debug!(
            count = page.messages.len(),
            has_more = self.has_more,
            "Applying history page"
        );
        reconciler.prepend_page(page.messages)
    }

    /// Release the in-flight slot after a failed fetch
    pub fn fail(&mut self) {
        self.in_flight = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockPersistence;
    use crate::backend::PersistenceApi;
    use eddy_wire::Message;
    use std::time::Instant;

    fn history(n: usize) -> Vec<Message> {
        (1..=n)
            .map(|i| Message::assistant(format!("m{}", i), format!("body {}", i)))
            .collect()
    }

    #[test]
    fn test_single_request_in_flight() {
        let mut pager = HistoryPager::new(20);
        let first = pager.next_request().unwrap();
        assert_eq!(first.before, None);
        assert_eq!(first.limit, 20);
        assert!(pager.next_request().is_none());

        pager.fail();
        assert!(pager.next_request().is_some());
    }

    #[tokio::test]
    async fn test_pages_back_to_the_start() {
        let persistence = MockPersistence::with_history(history(5));
        let mut reconciler = StreamReconciler::new();
        let mut pager = HistoryPager::new(2);

        let mut anchors = vec![];
        while let Some(request) = pager.next_request() {
            let page = persistence
                .fetch_page("c1", request.before.as_deref(), request.limit)
                .await
                .unwrap();
            anchors.push(pager.apply_page(&mut reconciler, page));
        }

        let ids: Vec<&str> = reconciler
            .store()
            .messages()
            .iter()
            .map(|m| m.id.as_str())
            .collect();
        assert_eq!(ids, vec!["m1", "m2", "m3", "m4", "m5"]);
        assert_eq!(
            anchors,
            vec![None, Some("m4".to_string()), Some("m2".to_string())]
        );
        assert_eq!(pager.oldest(), Some("m1"));
        assert!(!pager.has_more());
    }

    #[test]
    fn test_page_overlapping_live_messages() {
        let mut reconciler = StreamReconciler::new();
        let now = Instant::now();
        reconciler.ingest(
            &eddy_wire::RawFrame::new(
                "new_message",
                r#"{"id": "m3", "role": "assistant", "content": "live copy"}"#,
            ),
            now,
        );

        let mut pager = HistoryPager::new(10);
        pager.next_request();
        let anchor = pager.apply_page(
            &mut reconciler,
            Page {
                messages: history(3),
                has_more: false,
            },
        );

        assert_eq!(anchor.as_deref(), Some("m3"));
        let ids: Vec<&str> = reconciler
            .store()
            .messages()
            .iter()
            .map(|m| m.id.as_str())
            .collect();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);
        assert_eq!(reconciler.store().get("m3").unwrap().content, "live copy");
    }
}
