//! Pokes a server started with
//! `cargo run -- --path tests/fixtures/commands --shebang sh --port 8000`.

use serde_json::json;

const URL: &str = "http://localhost:8000";

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let hc = httpc_test::new_client(URL)?;

    hc.do_get("/hello").await?.print().await?;
    hc.do_get("/hello/Jhon").await?.print().await?;
    hc.do_get("/bye").await?.print().await?;

    let response = hc
        .do_post("/echo", json!({ "names": ["a", "b"], "quoted": "Sarah \"Connor\"" }))
        .await?;
    response.print().await?;
    if let Some(output) = response.json_body()?["result"].as_str() {
        println!("Arguments:\n{output}");
    }

    Ok(())
}
