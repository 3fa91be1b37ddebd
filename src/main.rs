use actix_web::{web, App, HttpServer};
use clap::Parser;
use log::{error, info, warn};
use pixsim_relay::broker::Broker;
use pixsim_relay::catalog::MapCatalog;
use pixsim_relay::compiler::ControllerSet;
use pixsim_relay::config::{load_dialect_sources, Args};
use pixsim_relay::handlers::{controller_get, game_ws, map_get, map_list, status};
use pixsim_relay::pixels::{LookupTable, PixelConverter};
use pixsim_relay::script_loader::{HttpFetcher, ScriptLoader, ScriptLoaderConfig};
use std::collections::HashMap;
use std::sync::Arc;

/// Build the translation subsystems: lookup table, one extractor isolate per
/// dialect, converter, catalog, controllers.
async fn bootstrap(args: &Args) -> Result<Arc<Broker>, String> {
    let lookup = LookupTable::from_path(&args.lookup_path()).map_err(|e| e.to_string())?;
    let sources = load_dialect_sources(&args.dialects_path()).map_err(|e| e.to_string())?;
    let fetcher = HttpFetcher::new().map_err(|e| e.to_string())?;

    let mut extracted = HashMap::new();
    for source in &sources {
        let config = ScriptLoaderConfig {
            primary_url: source.url.clone(),
            fallback_url: source.fallback_url.clone(),
            cache_dir: args.cache_dir.clone(),
            allow_cache: !args.no_cache,
            allow_insecure: args.allow_insecure,
        };
        let loader = ScriptLoader::load(&config, &fetcher)
            .await
            .map_err(|e| format!("{}: {e}", source.dialect))?;
        let value = loader
            .execute(&source.extractor)
            .map_err(|e| format!("{}: {e}", source.dialect))?;
        loader.terminate();
        extracted.insert(source.dialect, value);
        info!("dialect {} extractor loaded", source.dialect);
    }

    let converter = Arc::new(PixelConverter::build(&lookup, &extracted));
    let catalog = Arc::new(
        MapCatalog::load(&args.maps_dir(), &converter).map_err(|e| e.to_string())?,
    );
    let controllers = Arc::new(ControllerSet::load(&args.controllers_dir(), &converter));

    Broker::new(converter, catalog, controllers).map_err(|e| e.to_string())
}

/// A broker that serves only `/pixsim-api/status` with the crashed flag
/// latched; everything else refuses.
fn crashed_broker() -> Arc<Broker> {
    let lookup = LookupTable::from_csv("id,standard\n").expect("static header parses");
    let converter = Arc::new(PixelConverter::build(&lookup, &HashMap::new()));
    let broker = Broker::new(
        converter,
        Arc::new(MapCatalog::empty()),
        Arc::new(ControllerSet::empty()),
    )
    .expect("keypair generation");
    broker.set_crashed();
    broker.close();
    broker
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init();
    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Warning: RUST_LOG environment variable not set. Set it to display logs!");
        eprintln!("Recommended: RUST_LOG=info ./pixsim-relay");
    }

    let args = Args::parse();
    let addr = (args.host.clone(), args.port);

    info!("starting pixsim relay on {}:{}", args.host, args.port);
    let broker = match bootstrap(&args).await {
        Ok(broker) => broker,
        Err(e) => {
            error!("startup failed, serving crashed status only: {e}");
            crashed_broker()
        }
    };
    broker.spawn_maintenance();

    if broker.is_crashed() {
        warn!("broker is crashed; refusing game connections");
    } else {
        info!(
            "serving dialects: {}",
            broker
                .converter
                .formats()
                .iter()
                .map(|d| d.as_tag())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }

    let data = web::Data::from(broker);
    HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .route("/pixsim-api/status", web::get().to(status))
            .route("/pixsim-api/maps/list/{game_mode}", web::get().to(map_list))
            .route("/pixsim-api/maps/{game_mode}/{id}", web::get().to(map_get))
            .route(
                "/pixsim-api/controllers/{path:.*}",
                web::get().to(controller_get),
            )
            .route("/pixsim-api/game", web::get().to(game_ws))
    })
    .bind(addr)?
    .run()
    .await
}
