use std::path::PathBuf;

use cardlearn::config::{self, AppSettings};
use cardlearn::extractor::{BurnExtractor, FeatureExtractor, RemoteExtractorSource, sha256_file};

fn main() {
    let AppSettings {
        extractor: mut settings,
        logging,
        ..
    } = match config::load_or_default() {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("Failed to load settings: {err}");
            std::process::exit(1);
        }
    };
    if let Err(err) = cardlearn::logging::init(&logging) {
        eprintln!("Logging disabled: {err}");
    }
    let mut models_dir: Option<PathBuf> = None;
    let mut force = false;
    let mut warm_up = true;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--url" => {
                if let Some(value) = args.next() {
                    settings.url = Some(value);
                }
            }
            "--sha256" => {
                if let Some(value) = args.next() {
                    settings.sha256 = Some(value);
                }
            }
            "--allow-host" => {
                if let Some(value) = args.next() {
                    settings.allowed_hosts.push(value.trim().to_ascii_lowercase());
                }
            }
            "--models-dir" => {
                if let Some(value) = args.next() {
                    models_dir = Some(PathBuf::from(value));
                }
            }
            "--force" => {
                force = true;
            }
            "--no-warm-up" => {
                warm_up = false;
            }
            "--help" | "-h" => {
                print_help();
                return;
            }
            _ => {}
        }
    }

    let input_size = settings.input_size;
    let source = match models_dir {
        Some(dir) => RemoteExtractorSource::with_models_dir(settings, dir),
        None => match RemoteExtractorSource::new(settings) {
            Ok(source) => source,
            Err(err) => {
                eprintln!("Failed to resolve models directory: {err}");
                std::process::exit(1);
            }
        },
    };

    let path = match source.ensure_weights(force) {
        Ok(path) => path,
        Err(err) => {
            eprintln!("Failed to prepare encoder weights: {err}");
            std::process::exit(1);
        }
    };
    match sha256_file(&path) {
        Ok(digest) => println!("Encoder weights ready: {} (sha256 {digest})", path.display()),
        Err(err) => {
            eprintln!("Failed to hash {}: {err}", path.display());
            std::process::exit(1);
        }
    }

    if warm_up {
        let result = BurnExtractor::from_burnpack(&path, input_size)
            .map_err(|err| err.to_string())
            .and_then(|extractor| {
                extractor.warm_up().map_err(|err| err.to_string())?;
                Ok(extractor.feature_len())
            });
        match result {
            Ok(features) => println!("Encoder loaded; produces {features} features per frame"),
            Err(err) => {
                eprintln!("Encoder failed to load: {err}");
                std::process::exit(1);
            }
        }
    }
}

fn print_help() {
    println!(
        "Usage: cardlearn-model-setup [--url <https-url>] [--sha256 <hex>] [--allow-host <host>] [--models-dir <path>] [--force] [--no-warm-up]"
    );
}
