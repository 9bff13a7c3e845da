use anyhow::{Context, Result};
use prism_transport::{Method, RequestBody, RequestOptions, RequestParams, Transport};

/// Send one request and print the response body
pub async fn run_request(
    transport: &Transport,
    method: &str,
    path: &str,
    body: Option<String>,
    query: Vec<String>,
) -> Result<()> {
    let method = Method::from_bytes(method.to_uppercase().as_bytes())
        .with_context(|| format!("Invalid HTTP method '{}'", method))?;

    let mut params = RequestParams::new(method, path);
    for pair in query {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("Query parameter '{}' is not key=value", pair))?;
        params = params.with_query(key, value);
    }
    if let Some(body) = body {
        let json: serde_json::Value =
            serde_json::from_str(&body).context("Request body is not valid JSON")?;
        params = params.with_body(RequestBody::Json(json));
    }

    let response = transport.request(params, RequestOptions::default()).await?;
    tracing::debug!(
        "Request {} answered with {} after {} retries",
        response.meta.id,
        response.status,
        response.meta.attempts
    );

    println!("{}", serde_json::to_string_pretty(&response.body)?);
    Ok(())
}
