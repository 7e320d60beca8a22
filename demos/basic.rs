use admin_http::{BaseClient, ClientConfig, QueryParams};
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let base_url = std::env::var("ADMIN_API_URL")?;
    let api_key = std::env::var("ADMIN_API_KEY")?;

    let client = BaseClient::new(ClientConfig::new(base_url).with_api_key(api_key))?;

    client
        .post("/system/role", json!({"resource": [{"name": "demo", "is_active": true}]}))
        .await?;

    let roles = client
        .get_with(
            "/system/role",
            QueryParams::new()
                .filter("name like 'demo%'")
                .fields(["id", "name"])
                .limit(10)
                .include_count(true),
        )
        .await?;

    println!("{:#?}", roles.data);
    if let Some(page) = roles.meta.pagination {
        println!(
            "showing {} of {} (more: {})",
            page.limit.min(page.total),
            page.total,
            page.has_more
        );
    }

    Ok(())
}
