use std::sync::Arc;

use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

use super::chat_repository::{BoxFuture, ChatRepository};
use super::error::{RepositoryError, RepositoryResult};
use crate::models::{Chat, Message};
use crate::services::auth_service::IdentityProvider;
use crate::services::supabase::{SupabaseConfig, describe_error};

/// Postgres error code for a foreign-key violation.
const FOREIGN_KEY_VIOLATION: &str = "23503";

/// Chat store backed by the Supabase PostgREST API.
#[derive(Clone)]
pub struct SupabaseChatRepository {
    client: reqwest::Client,
    config: SupabaseConfig,
    identity: Arc<dyn IdentityProvider>,
}

impl SupabaseChatRepository {
    pub fn new(config: SupabaseConfig, identity: Arc<dyn IdentityProvider>) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            identity,
        }
    }

    /// Request with `apikey` and the user's bearer token (anon key when signed out).
    async fn request(&self, method: Method, table: &str) -> RepositoryResult<RequestBuilder> {
        let token = self
            .identity
            .access_token()
            .await
            .map_err(|e| RepositoryError::Unauthorized {
                message: e.to_string(),
            })?
            .unwrap_or_else(|| self.config.anon_key.clone());

        Ok(self
            .client
            .request(method, self.config.rest_url(table))
            .header("apikey", &self.config.anon_key)
            .bearer_auth(token))
    }

    async fn send(builder: RequestBuilder) -> RepositoryResult<Response> {
        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) if e.is_connect() || e.is_timeout() => {
                return Err(RepositoryError::unavailable(e.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let (message, code) = describe_error(&body);
        debug!(status = status.as_u16(), code = ?code, %message, "PostgREST request failed");

        Err(match status {
            s if s.is_server_error() => RepositoryError::unavailable(message),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                RepositoryError::Unauthorized { message }
            }
            StatusCode::NOT_FOUND => RepositoryError::not_found("resource", message),
            _ if code.as_deref() == Some(FOREIGN_KEY_VIOLATION) => {
                RepositoryError::not_found("chat", message)
            }
            _ => RepositoryError::Rejected {
                status: status.as_u16(),
                message,
            },
        })
    }

    async fn fetch<T: DeserializeOwned>(builder: RequestBuilder) -> RepositoryResult<Vec<T>> {
        let response = Self::send(builder).await?;
        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Mutation that must touch at least one row.
    async fn mutate_one(builder: RequestBuilder, id: &str) -> RepositoryResult<()> {
        let rows: Vec<Chat> =
            Self::fetch(builder.header("Prefer", "return=representation")).await?;
        if rows.is_empty() {
            return Err(RepositoryError::not_found("chat", id));
        }
        Ok(())
    }

    fn message_query(
        &self,
        chat_id: &str,
        limit: Option<usize>,
    ) -> BoxFuture<'static, RepositoryResult<Vec<Message>>> {
        let this = self.clone();
        let filter = format!("eq.{chat_id}");

        Box::pin(async move {
            let mut builder = this
                .request(Method::GET, "message")
                .await?
                .query(&[("chat_id", filter.as_str()), ("order", "created_at.asc")]);
            if let Some(limit) = limit {
                builder = builder.query(&[("limit", limit.to_string())]);
            }
            Self::fetch(builder).await
        })
    }
}

impl ChatRepository for SupabaseChatRepository {
    fn add_chat(&self, chat: Chat) -> BoxFuture<'static, RepositoryResult<()>> {
        let this = self.clone();
        Box::pin(async move {
            let builder = this
                .request(Method::POST, "chat")
                .await?
                .header("Prefer", "return=minimal")
                .json(&chat);
            Self::send(builder).await?;
            debug!(chat_id = %chat.id, "Chat created");
            Ok(())
        })
    }

    fn get_chat(&self, id: &str) -> BoxFuture<'static, RepositoryResult<Option<Chat>>> {
        let this = self.clone();
        let filter = format!("eq.{id}");
        Box::pin(async move {
            let builder = this
                .request(Method::GET, "chat")
                .await?
                .query(&[("cid", filter.as_str()), ("select", "*")]);
            let rows: Vec<Chat> = Self::fetch(builder).await?;
            Ok(rows.into_iter().next())
        })
    }

    fn delete_chat(&self, id: &str) -> BoxFuture<'static, RepositoryResult<()>> {
        let this = self.clone();
        let id = id.to_string();
        Box::pin(async move {
            let filter = format!("eq.{id}");

            let messages = this
                .request(Method::DELETE, "message")
                .await?
                .query(&[("chat_id", filter.as_str())]);
            Self::send(messages).await?;

            let chat = this
                .request(Method::DELETE, "chat")
                .await?
                .query(&[("cid", filter.as_str())]);
            Self::mutate_one(chat, &id).await
        })
    }

    fn list_chats(
        &self,
        owner_id: &str,
        archived: bool,
    ) -> BoxFuture<'static, RepositoryResult<Vec<Chat>>> {
        let this = self.clone();
        let owner = format!("eq.{owner_id}");
        let archived = format!("eq.{archived}");
        Box::pin(async move {
            let builder = this.request(Method::GET, "chat").await?.query(&[
                ("user_id", owner.as_str()),
                ("archived", archived.as_str()),
                ("order", "created_at.desc"),
            ]);
            Self::fetch(builder).await
        })
    }

    fn set_archived(&self, id: &str, archived: bool) -> BoxFuture<'static, RepositoryResult<()>> {
        let this = self.clone();
        let id = id.to_string();
        Box::pin(async move {
            let filter = format!("eq.{id}");
            let builder = this
                .request(Method::PATCH, "chat")
                .await?
                .query(&[("cid", filter.as_str())])
                .json(&serde_json::json!({ "archived": archived }));
            Self::mutate_one(builder, &id).await
        })
    }

    fn add_message(&self, message: Message) -> BoxFuture<'static, RepositoryResult<()>> {
        let this = self.clone();
        Box::pin(async move {
            let builder = this
                .request(Method::POST, "message")
                .await?
                .header("Prefer", "return=minimal")
                .json(&message);
            Self::send(builder).await?;
            Ok(())
        })
    }

    fn list_messages(&self, chat_id: &str) -> BoxFuture<'static, RepositoryResult<Vec<Message>>> {
        self.message_query(chat_id, None)
    }

    fn first_two_messages(
        &self,
        chat_id: &str,
    ) -> BoxFuture<'static, RepositoryResult<Vec<Message>>> {
        self.message_query(chat_id, Some(2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Sender;
    use crate::testing::StaticIdentity;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn repo(server: &MockServer) -> SupabaseChatRepository {
        SupabaseChatRepository::new(
            SupabaseConfig::new(server.uri(), "anon"),
            Arc::new(StaticIdentity::signed_in("user-1").with_token("user-jwt")),
        )
    }

    fn chat_row(id: &str) -> serde_json::Value {
        serde_json::json!({
            "cid": id,
            "user_id": "user-1",
            "archived": false,
            "created_at": "2025-03-01T12:00:00.123456+00:00"
        })
    }

    #[tokio::test]
    async fn test_list_chats_filters_and_orders() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/chat"))
            .and(header("apikey", "anon"))
            .and(header("authorization", "Bearer user-jwt"))
            .and(query_param("user_id", "eq.user-1"))
            .and(query_param("archived", "eq.false"))
            .and(query_param("order", "created_at.desc"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!([chat_row("c2"), chat_row("c1")])),
            )
            .mount(&server)
            .await;

        let chats = repo(&server).list_chats("user-1", false).await.unwrap();
        let ids: Vec<_> = chats.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["c2", "c1"]);
    }

    #[tokio::test]
    async fn test_first_two_messages_uses_limit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/message"))
            .and(query_param("chat_id", "eq.c1"))
            .and(query_param("order", "created_at.asc"))
            .and(query_param("limit", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"mid": "m1", "chat_id": "c1", "sender": "user", "content": "Hello",
                 "created_at": "2025-03-01T12:00:00Z"},
                {"mid": "m2", "chat_id": "c1", "sender": "model", "content": "Hi there!",
                 "created_at": "2025-03-01T12:00:01Z"}
            ])))
            .mount(&server)
            .await;

        let preview = repo(&server).first_two_messages("c1").await.unwrap();
        assert_eq!(preview.len(), 2);
        assert_eq!(preview[1].sender, Sender::Assistant);
    }

    #[tokio::test]
    async fn test_add_message_posts_backend_columns() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/message"))
            .and(body_partial_json(serde_json::json!({
                "chat_id": "c1", "sender": "user", "content": "Hello"
            })))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let message = Message::new("c1", Sender::User, "Hello", chrono::Utc::now());
        repo(&server).add_message(message).await.unwrap();
    }

    #[tokio::test]
    async fn test_set_archived_on_missing_chat_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/rest/v1/chat"))
            .and(query_param("cid", "eq.ghost"))
            .and(header("prefer", "return=representation"))
            .and(body_partial_json(serde_json::json!({"archived": true})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&server)
            .await;

        let result = repo(&server).set_archived("ghost", true).await;
        assert!(matches!(result, Err(RepositoryError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_delete_removes_messages_then_chat() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/rest/v1/message"))
            .and(query_param("chat_id", "eq.c1"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/rest/v1/chat"))
            .and(query_param("cid", "eq.c1"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!([chat_row("c1")])),
            )
            .expect(1)
            .mount(&server)
            .await;

        repo(&server).delete_chat("c1").await.unwrap();
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/chat"))
            .respond_with(ResponseTemplate::new(503).set_body_string("upstream down"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/message"))
            .respond_with(ResponseTemplate::new(409).set_body_json(serde_json::json!({
                "code": "23503",
                "message": "insert or update on table \"message\" violates foreign key constraint"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/chat"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
                "code": "PGRST301", "message": "JWT expired"
            })))
            .mount(&server)
            .await;

        let repo = repo(&server);

        let err = repo.add_chat(Chat::new("c1", "user-1")).await.unwrap_err();
        assert!(matches!(err, RepositoryError::BackendUnavailable { .. }));
        assert!(err.is_transient());

        let err = repo
            .add_message(Message::new("nope", Sender::User, "hi", chrono::Utc::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound { kind: "chat", .. }));

        let err = repo.get_chat("c1").await.unwrap_err();
        assert!(matches!(err, RepositoryError::Unauthorized { .. }));
    }
}
