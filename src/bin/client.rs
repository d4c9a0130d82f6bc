use argh::FromArgs;
use blip_captioner::{messages::DescribeResponse, server::IMAGE_FIELD};
use reqwest::multipart::{Form, Part};
use std::path::PathBuf;

// defaults for the client
const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 5000;

#[derive(FromArgs)]
/// Upload an image to the captioner and print its description
struct ClientArgs {
    /// the host to connect to
    #[argh(option, short = 'h', default = "DEFAULT_HOST.to_string()")]
    host: String,

    /// the port to connect to
    #[argh(option, short = 'p', default = "DEFAULT_PORT")]
    port: u16,

    /// the path to the image
    #[argh(option, short = 'i')]
    image_path: PathBuf,

    /// print the raw json response
    #[argh(switch)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: ClientArgs = argh::from_env();

    let file_name = args
        .image_path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("image")
        .to_string();
    let bytes = tokio::fs::read(&args.image_path).await?;

    let form = Form::new().part(IMAGE_FIELD, Part::bytes(bytes).file_name(file_name));

    let response = reqwest::Client::new()
        .post(format!("http://{}:{}/describe", args.host, args.port))
        .multipart(form)
        .send()
        .await?;

    let status = response.status();
    let result = response.json::<serde_json::Value>().await?;

    if args.json || !status.is_success() {
        println!("Result: {}", serde_json::to_string_pretty(&result)?);
        if !status.is_success() {
            return Err(format!("server answered {status}").into());
        }
        return Ok(());
    }

    let description: DescribeResponse = serde_json::from_value(result)?;
    println!("{}", description.description);

    Ok(())
}
