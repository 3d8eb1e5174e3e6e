//! REST collaborator: conversation listing, paged history, unread count and
//! conversation deletion.

use futures::future::BoxFuture;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use url::Url;

use crate::config::ClientConfig;
use crate::credentials::Credentials;
use crate::error::{Error, Result};
use crate::models::{ConversationKey, ConversationSummary, Message, UnreadCount};

pub type ApiFuture<'a, T> = BoxFuture<'a, Result<T>>;

pub trait ChatApi: Send + Sync {
    fn list_conversations(&self) -> ApiFuture<'_, Vec<ConversationSummary>>;

    /// One history page, newest-first.
    fn list_messages(&self, key: ConversationKey, page: u32, size: u32)
        -> ApiFuture<'_, Vec<Message>>;

    fn unread_count(&self) -> ApiFuture<'_, u32>;

    /// Idempotent on the server side.
    fn delete_conversation(&self, key: ConversationKey) -> ApiFuture<'_, ()>;
}

// ============================================================================
// HTTP implementation
// ============================================================================

pub struct HttpApi {
    client: Client,
    base_url: Url,
    credentials: Credentials,
}

impl HttpApi {
    pub fn new(config: &ClientConfig, credentials: Credentials) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;

        Ok(Self {
            client,
            base_url: config.http_url()?,
            credentials,
        })
    }

    fn authorized(&self, req: RequestBuilder) -> Result<RequestBuilder> {
        let auth = self.credentials.auth_header().ok_or(Error::NotAuthenticated)?;
        Ok(req.header("Authorization", auth))
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
        let resp = self.authorized(self.client.get(url))?.send().await?;
        Ok(check(resp)?.json::<T>().await?)
    }
}

fn check(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(Error::Unauthorized);
    }
    if !status.is_success() {
        return Err(Error::Http(format!("{} returned {}", resp.url().path(), status)));
    }
    Ok(resp)
}

impl ChatApi for HttpApi {
    fn list_conversations(&self) -> ApiFuture<'_, Vec<ConversationSummary>> {
        Box::pin(async move {
            let url = self.base_url.join("api/chat/conversations")?;
            self.get_json(url).await
        })
    }

    fn list_messages(
        &self,
        key: ConversationKey,
        page: u32,
        size: u32,
    ) -> ApiFuture<'_, Vec<Message>> {
        Box::pin(async move {
            let mut url = self.base_url.join("api/chat/messages")?;
            url.query_pairs_mut()
                .append_pair("rideId", &key.ride_id.to_string())
                .append_pair("otherEmpId", &key.counterpart_id.to_string())
                .append_pair("page", &page.to_string())
                .append_pair("size", &size.to_string());
            self.get_json(url).await
        })
    }

    fn unread_count(&self) -> ApiFuture<'_, u32> {
        Box::pin(async move {
            let url = self.base_url.join("api/chat/unread-count")?;
            let count: UnreadCount = self.get_json(url).await?;
            Ok(count.unread)
        })
    }

    fn delete_conversation(&self, key: ConversationKey) -> ApiFuture<'_, ()> {
        Box::pin(async move {
            let url = self.base_url.join(&format!(
                "api/chat/conversations/{}/{}",
                key.ride_id, key.counterpart_id
            ))?;
            let resp = self.authorized(self.client.delete(url))?.send().await?;
            check(resp)?;
            Ok(())
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory REST collaborator.

    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::Notify;

    #[derive(Default)]
    pub struct MemoryApi {
        pub conversations: Mutex<Vec<ConversationSummary>>,
        pub pages: Mutex<HashMap<(ConversationKey, u32), Vec<Message>>>,
        /// `None` makes the unread endpoint fail.
        pub unread: Mutex<Option<u32>>,
        pub fail_listing: Mutex<bool>,
        pub deleted: Mutex<Vec<ConversationKey>>,
        /// When set, history fetches wait for one permit before answering.
        pub page_gate: Mutex<Option<Arc<Notify>>>,
        pub unread_calls: AtomicUsize,
        pub page_calls: AtomicUsize,
    }

    impl MemoryApi {
        pub fn new() -> Arc<Self> {
            let api = Self::default();
            *api.unread.lock() = Some(0);
            Arc::new(api)
        }

        pub fn set_page(&self, key: ConversationKey, page: u32, batch: Vec<Message>) {
            self.pages.lock().insert((key, page), batch);
        }

        pub fn set_unread(&self, unread: Option<u32>) {
            *self.unread.lock() = unread;
        }

        pub fn gate_pages(&self) -> Arc<Notify> {
            let gate = Arc::new(Notify::new());
            *self.page_gate.lock() = Some(Arc::clone(&gate));
            gate
        }

        pub fn unread_calls(&self) -> usize {
            self.unread_calls.load(Ordering::SeqCst)
        }

        pub fn page_calls(&self) -> usize {
            self.page_calls.load(Ordering::SeqCst)
        }
    }

    impl ChatApi for MemoryApi {
        fn list_conversations(&self) -> ApiFuture<'_, Vec<ConversationSummary>> {
            let result = if *self.fail_listing.lock() {
                Err(Error::Network("listing unavailable".to_string()))
            } else {
                Ok(self.conversations.lock().clone())
            };
            Box::pin(async move { result })
        }

        fn list_messages(
            &self,
            key: ConversationKey,
            page: u32,
            _size: u32,
        ) -> ApiFuture<'_, Vec<Message>> {
            self.page_calls.fetch_add(1, Ordering::SeqCst);
            let batch = self.pages.lock().get(&(key, page)).cloned().unwrap_or_default();
            let gate = self.page_gate.lock().clone();
            Box::pin(async move {
                if let Some(gate) = gate {
                    gate.notified().await;
                }
                Ok(batch)
            })
        }

        fn unread_count(&self) -> ApiFuture<'_, u32> {
            self.unread_calls.fetch_add(1, Ordering::SeqCst);
            let result = (*self.unread.lock())
                .ok_or_else(|| Error::Network("unread endpoint unavailable".to_string()));
            Box::pin(async move { result })
        }

        fn delete_conversation(&self, key: ConversationKey) -> ApiFuture<'_, ()> {
            self.deleted.lock().push(key);
            Box::pin(async { Ok(()) })
        }
    }
}
