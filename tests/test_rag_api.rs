//! End-to-end: RAG models attached to an in-process fake embeddings server.

use std::sync::Arc;

use axum::Json;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use axum::routing::post;
use serde_json::{Value, json};
use tower::ServiceExt;

use llm_serve::config::Config;
use llm_serve::models::{Models, create_app};

async fn fake_tei() -> String {
    let app = axum::Router::new()
        .route(
            "/embed",
            post(|Json(body): Json<Value>| async move {
                let n = body["inputs"].as_array().map(Vec::len).unwrap_or(0);
                Json(json!(vec![vec![0.5_f32, 0.25, -1.0]; n]))
            }),
        )
        .route(
            "/rerank",
            post(|Json(body): Json<Value>| async move {
                // Score by text length so the longest document ranks first.
                let scores: Vec<Value> = body["texts"]
                    .as_array()
                    .map(|texts| {
                        texts
                            .iter()
                            .enumerate()
                            .map(|(i, t)| {
                                let len = t.as_str().map(str::len).unwrap_or(0);
                                json!({"index": i, "score": len as f32 / 10.0})
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                Json(Value::Array(scores))
            }),
        );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

async fn rag_app() -> axum::Router {
    let endpoint = fake_tei().await;
    let mut cfg = Config::test_default();
    cfg.model.tasks = vec!["rag".into()];
    cfg.rag.embedding_name = Some("bge-small".into());
    cfg.rag.embedding_endpoint = Some(endpoint.clone());
    cfg.rag.rerank_name = Some("bge-reranker".into());
    cfg.rag.rerank_endpoint = Some(endpoint);

    let models = Models::build(&cfg).await.unwrap();
    assert!(models.engine.is_none());
    assert!(models.embedding.is_some());
    assert!(models.reranker.is_some());
    create_app(Arc::new(cfg), Arc::new(models))
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn json_body(resp: axum::response::Response) -> Value {
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_embeddings_list_shape() {
    let app = rag_app().await;
    let resp = app
        .oneshot(post_json("/v1/embeddings", json!({"input": ["first", "second"]})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let body = json_body(resp).await;
    assert_eq!(body["object"], "list");
    assert_eq!(body["model"], "bge-small");
    let data = body["data"].as_array().unwrap();
    assert_eq!(data.len(), 2);
    assert_eq!(data[1]["object"], "embedding");
    assert_eq!(data[1]["index"], 1);
    assert_eq!(data[1]["embedding"], json!([0.5, 0.25, -1.0]));
}

#[tokio::test]
async fn test_single_string_input_embeds_once() {
    let app = rag_app().await;
    let resp = app
        .oneshot(post_json("/v1/embeddings", json!({"input": "just one"})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(resp).await["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_empty_embedding_input_is_400() {
    let app = rag_app().await;
    let resp = app
        .oneshot(post_json("/v1/embeddings", json!({"input": []})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(resp).await["error"]["type"], "invalid_request_error");
}

#[tokio::test]
async fn test_rerank_top_n_with_documents() {
    let app = rag_app().await;
    let resp = app
        .oneshot(post_json(
            "/v1/rerank",
            json!({
                "query": "which is longest",
                "documents": ["a", "a much longer one", "mid size"],
                "top_n": 2,
                "return_documents": true
            }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let body = json_body(resp).await;
    assert_eq!(body["model"], "bge-reranker");
    let results = body["results"].as_array().unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0]["index"], 1);
    assert_eq!(results[0]["document"]["text"], "a much longer one");
    assert_eq!(results[1]["index"], 2);
    assert_eq!(results[1]["document"]["text"], "mid size");
    let first = results[0]["relevance_score"].as_f64().unwrap();
    let second = results[1]["relevance_score"].as_f64().unwrap();
    assert!(first > second);
}

#[tokio::test]
async fn test_rerank_omits_documents_by_default() {
    let app = rag_app().await;
    let resp = app
        .oneshot(post_json(
            "/v1/rerank",
            json!({"query": "q", "documents": ["short", "longer text"]}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let results = json_body(resp).await["results"].as_array().unwrap().clone();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0]["index"], 1);
    assert!(results.iter().all(|r| r.get("document").is_none()));
}
