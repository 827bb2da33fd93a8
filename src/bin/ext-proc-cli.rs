use clap::{Parser, Subcommand};
use envoy_types::pb::envoy::config::core::v3::{HeaderMap, HeaderValue};
use envoy_types::pb::envoy::service::ext_proc::v3::{
    external_processor_client::ExternalProcessorClient, processing_request, processing_response,
    HttpHeaders, ProcessingRequest,
};
use ext_proc_header_manipulation::processor::{mutation, DIRECTIVE_HEADER};
use serde_json::{json, Value};
use tonic_health::pb::health_client::HealthClient;
use tonic_health::pb::health_check_response::ServingStatus;
use tonic_health::pb::HealthCheckRequest;

#[derive(Parser)]
#[command(name = "ext-proc-cli")]
#[command(
    about = "Diagnostic CLI for the Envoy ext_proc header manipulation server",
    long_about = None
)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:18080")]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a grpc.health.v1 check
    Health {
        /// Service name to check
        #[arg(short, long, default_value = "")]
        service: String,
    },
    /// Send one headers event carrying a directive and print the mutation
    Headers {
        /// JSON directive, e.g. '{"addHeaders":{"x-foo":"bar"}}'
        #[arg(short, long)]
        directive: String,

        /// Send as ResponseHeaders instead of RequestHeaders
        #[arg(long)]
        response: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Health { service } => {
            let mut client = HealthClient::new(tonic::transport::Endpoint::new(cli.url)?.connect().await?);
            let res = client.check(HealthCheckRequest { service }).await?.into_inner();
            let status = ServingStatus::try_from(res.status)
                .map(|s| s.as_str_name().to_string())
                .unwrap_or_else(|_| res.status.to_string());
            print_json(&json!({ "status": status }))?;
        }
        Commands::Headers { directive, response } => {
            let mut client = ExternalProcessorClient::new(tonic::transport::Endpoint::new(cli.url)?.connect().await?);
            let headers = HttpHeaders {
                headers: Some(HeaderMap {
                    headers: vec![HeaderValue {
                        key: DIRECTIVE_HEADER.to_string(),
                        raw_value: directive.into_bytes(),
                        ..Default::default()
                    }],
                }),
                ..Default::default()
            };
            let event = if response {
                processing_request::Request::ResponseHeaders(headers)
            } else {
                processing_request::Request::RequestHeaders(headers)
            };
            let request = ProcessingRequest {
                request: Some(event),
                ..Default::default()
            };

            let mut stream = client
                .process(tokio_stream::iter(vec![request]))
                .await?
                .into_inner();

            match stream.message().await? {
                Some(resp) => print_json(&describe(&resp.response))?,
                None => eprintln!("Error: stream closed without a response"),
            }
        }
    }

    Ok(())
}

fn describe(response: &Option<processing_response::Response>) -> Value {
    use processing_response::Response;

    let (kind, headers) = match response {
        Some(Response::RequestHeaders(h)) => ("request_headers", h),
        Some(Response::ResponseHeaders(h)) => ("response_headers", h),
        Some(_) => return json!({ "kind": "other" }),
        None => return json!({ "kind": "empty" }),
    };

    let Some(m) = mutation::mutation_of(headers) else {
        return json!({ "kind": kind, "mutation": null });
    };

    let set: serde_json::Map<String, Value> = m
        .set_headers
        .iter()
        .filter_map(|opt| opt.header.as_ref())
        .map(|h| {
            let value = String::from_utf8_lossy(&h.raw_value).into_owned();
            (h.key.clone(), Value::String(value))
        })
        .collect();

    json!({
        "kind": kind,
        "mutation": {
            "setHeaders": set,
            "removeHeaders": m.remove_headers,
        }
    })
}

fn print_json(value: &Value) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
