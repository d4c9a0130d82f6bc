use argh::FromArgs;
use blip_captioner::{
    Blip, BlipConfig, InferenceEngine, ServerConfig,
    blip::{BlipVariant, DEFAULT_MAX_LENGTH},
    preprocess::DEFAULT_MAX_IMAGE_BYTES,
};
use std::{path::PathBuf, sync::Arc};

// defaults for the server
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 5000;

#[derive(FromArgs)]
/// Serve BLIP image captions over HTTP.
struct CaptionerArgs {
    /// the host to run the server on
    #[argh(option, short = 'h', default = "DEFAULT_HOST.to_string()")]
    host: String,

    /// the port to run the server on
    #[argh(option, short = 'p', default = "DEFAULT_PORT")]
    port: u16,

    /// model size, "base" or "large" (default: base, large when quantized)
    #[argh(option)]
    variant: Option<BlipVariant>,

    /// hub repository of the model and tokenizer, must match the variant
    #[argh(option)]
    model_id: Option<String>,

    /// revision of the model weights on the hub
    #[argh(option)]
    revision: Option<String>,

    /// use the q4k quantized weights of the large model (cpu only)
    #[argh(switch)]
    quantized: bool,

    /// local weights file instead of the hub download
    #[argh(option)]
    weights: Option<PathBuf>,

    /// local tokenizer.json instead of the hub download
    #[argh(option)]
    tokenizer: Option<PathBuf>,

    /// run on the cpu even if a gpu is available
    #[argh(switch)]
    cpu: bool,

    /// seed of the token sampler
    #[argh(option, default = "1337")]
    seed: u64,

    /// sampling temperature, greedy decoding when not set
    #[argh(option)]
    temperature: Option<f64>,

    /// nucleus sampling probability
    #[argh(option)]
    top_p: Option<f64>,

    /// maximum caption length in tokens, start token included
    #[argh(option, default = "DEFAULT_MAX_LENGTH")]
    max_length: usize,

    /// maximum size of an uploaded image in bytes
    #[argh(option, default = "DEFAULT_MAX_IMAGE_BYTES")]
    max_image_bytes: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args: CaptionerArgs = argh::from_env();

    // format the host and port
    let addr = format!("{}:{}", args.host, args.port);

    let variant = args.variant.unwrap_or(if args.quantized {
        BlipVariant::Large
    } else {
        BlipVariant::Base
    });

    log::info!("⏳ Loading BLIP {} model", variant);
    let model = Blip::new(BlipConfig {
        variant,
        model_id: args.model_id,
        revision: args.revision,
        quantized: args.quantized,
        weights: args.weights,
        tokenizer: args.tokenizer,
        cpu: args.cpu,
        seed: args.seed,
        temperature: args.temperature,
        top_p: args.top_p,
    })?;
    log::info!("✅ Model loaded on {}", model.device_name().to_uppercase());

    let engine = Arc::new(InferenceEngine::new(model));
    let app = blip_captioner::router(
        engine,
        ServerConfig {
            max_length: args.max_length,
            max_image_bytes: args.max_image_bytes,
        },
    );

    log::info!("🚀 Starting the server");
    log::info!("🔥 Listening on: {}", addr);
    log::info!("🔧 Press Ctrl+C to stop the server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    blip_captioner::serve(listener, app).await?;

    Ok(())
}
