use axum::{response::Html, routing::get, Router};
use fofa_view_rs::client::FofaClient;
use fofa_view_rs::config::FofaConfig;
use fofa_view_rs::query::icon_query;

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn client() -> FofaClient {
    FofaClient::new(&FofaConfig::default()).unwrap()
}

#[tokio::test]
async fn favicon_declared_in_page_is_hashed() {
    let base = serve(
        Router::new()
            .route(
                "/",
                get(|| async { Html(r#"<html><head><link rel="icon" href="/img/f.png"></head></html>"#) }),
            )
            .route("/img/f.png", get(|| async { b"fofa-favicon".to_vec() })),
    )
    .await;

    let q = client().favicon_query(&format!("{base}/")).await.unwrap();
    assert_eq!(q, "icon_hash=\"2854341567\"");
}

#[tokio::test]
async fn favicon_falls_back_to_site_root() {
    let icon: Vec<u8> = (0..=255).collect();
    let served = icon.clone();
    let base = serve(
        Router::new()
            .route("/", get(|| async { Html("<html><body>no icon here</body></html>") }))
            .route("/favicon.ico", get(move || async move { served })),
    )
    .await;

    let q = client().favicon_query(&base).await.unwrap();
    assert_eq!(q, icon_query(&icon));
}

#[tokio::test]
async fn favicon_lookup_reports_missing_icon() {
    let base = serve(Router::new().route("/", get(|| async { Html("<p>plain</p>") }))).await;
    assert!(client().favicon_query(&base).await.is_err());
    assert!(client().favicon_query("ftp://example.com").await.is_err());
}
