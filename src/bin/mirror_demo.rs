use std::collections::BTreeMap;
use std::time::Instant;

use anyhow::Result;
use clap::Parser;
use serde_json::json;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use graphql_mirror::config::DemoConfig;
use graphql_mirror::{
    Fidelity, FieldType, Mirror, MirrorOptions, MockTransport, Schema, Type, UpdateOptions,
};

#[derive(Parser)]
#[command(name = "mirror-demo", about = "GraphQL Mirror demo")]
struct Cli {
    /// Path to a TOML config file (see `DemoConfig`).
    config: String,
}

/// A tiny fixed schema — one issue with an author and one user — standing in
/// for whatever a real embedder would introspect or hand-describe.
fn demo_schema() -> Schema {
    let mut issue_fields = BTreeMap::new();
    issue_fields.insert("id".to_string(), FieldType::Id);
    issue_fields.insert("title".to_string(), FieldType::Primitive);
    issue_fields.insert(
        "author".to_string(),
        FieldType::Node {
            element_type: "User".to_string(),
            fidelity: Fidelity::Faithful,
        },
    );

    let mut user_fields = BTreeMap::new();
    user_fields.insert("id".to_string(), FieldType::Id);
    user_fields.insert("login".to_string(), FieldType::Primitive);

    let mut schema = Schema::new();
    schema.insert("Issue".to_string(), Type::Object { fields: issue_fields });
    schema.insert("User".to_string(), Type::Object { fields: user_fields });
    schema
}

#[tokio::main]
async fn main() -> Result<()> {
    let now = Instant::now();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    tracing::info!("starting graphql-mirror demo");

    let config = DemoConfig::load(&cli.config)?;
    config.validate()?;
    tracing::info!(path = %cli.config, "configuration loaded");

    let connect_options = SqliteConnectOptions::new()
        .filename(&config.database_path)
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(connect_options)
        .await?;

    let mirror = Mirror::new(pool, demo_schema(), MirrorOptions::default()).await?;
    tracing::info!("mirror initialized");

    mirror.register_object("Issue", "i1").await?;
    mirror.register_object("User", "u1").await?;

    let transport = MockTransport::new();
    transport.set_response(
        "owndata_0",
        json!([
            {"__typename": "Issue", "id": "i1", "title": "demo issue", "author": {"__typename": "User", "id": "u1"}}
        ]),
    );
    transport.set_response(
        "owndata_1",
        json!([{"__typename": "User", "id": "u1", "login": "demo-user"}]),
    );

    let options = UpdateOptions {
        since: 0,
        now: 1,
        nodes_limit: config.nodes_limit,
        nodes_of_type_limit: config.nodes_of_type_limit,
        connection_limit: config.connection_limit,
        connection_page_size: config.connection_page_size,
    };
    mirror.update(&transport, options).await?;
    tracing::info!("update step converged");

    let graph = mirror.extract("i1").await?;
    println!("extracted {} object(s) rooted at i1:", graph.len());
    println!("{:#?}", graph.root());

    tracing::info!(elapsed_ms = now.elapsed().as_millis(), "demo finished");
    Ok(())
}
