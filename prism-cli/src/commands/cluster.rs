use anyhow::Result;
use prism_transport::{Method, Node, RequestOptions, RequestParams, Transport};

/// Check that the cluster answers `HEAD /`
pub async fn run_ping(transport: &Transport) -> Result<()> {
    let result = transport
        .request(RequestParams::new(Method::HEAD, "/"), RequestOptions::default())
        .await;

    match result {
        Ok(response) => {
            let node = response
                .meta
                .node
                .as_ref()
                .map(|n| n.id().to_string())
                .unwrap_or_default();
            println!("alive ({} via {})", response.status, node);
            Ok(())
        }
        Err(e) => anyhow::bail!("unreachable: {}", e),
    }
}

/// Sniff the cluster and print the resulting node table
pub async fn run_sniff(transport: &Transport) -> Result<()> {
    let ids = transport.sniff().await?;
    tracing::info!("Sniff found {} node(s)", ids.len());

    print_nodes(&transport.pool().nodes());
    Ok(())
}

fn print_nodes(nodes: &[Node]) {
    println!("{:<24} {:<32} {:<8} {:<18}", "ID", "URL", "STATUS", "ROLES");
    println!("{}", "-".repeat(84));
    for node in nodes {
        let roles = match node.roles() {
            Some(r) => {
                let mut names = Vec::new();
                if r.master {
                    names.push("master");
                }
                if r.data {
                    names.push("data");
                }
                if r.ingest {
                    names.push("ingest");
                }
                names.join(",")
            }
            None => "-".to_string(),
        };
        println!(
            "{:<24} {:<32} {:<8} {:<18}",
            node.id(),
            node.url().as_str(),
            node.status().as_str(),
            roles
        );
    }
}
