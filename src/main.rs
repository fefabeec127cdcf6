use std::io::Cursor;

use actix_web::{middleware::Logger, rt, web, App, Error, HttpRequest, HttpResponse, HttpServer};
use actix_ws::AggregatedMessage;
use candle_transformers::models::whisper::Config;
use env_logger::Env;
use futures_util::StreamExt as _;

use whisper_driver::config::Settings;
use whisper_driver::driver::{WhisperDriver, WhisperOptions};
use whisper_driver::model::default_device;
use whisper_driver::service::{PromptInput, WhisperService};
use whisper_driver::{feature_extraction, whisper_repo};

struct AppState {
    service: WhisperService,
    config: Config,
}

async fn websocket_server(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let (res, mut session, stream) = actix_ws::handle(&req, stream)?;

    let mut stream = stream
        .max_frame_size(1024 * 1024)
        .aggregate_continuations()
        .max_continuation_size(2_usize.pow(20));

    rt::spawn(async move {
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(AggregatedMessage::Binary(bin)) => {
                    log::info!("Received binary websocket message");
                    match transcribe(&state, bin.to_vec()).await {
                        Ok(transcription) => {
                            log::info!("Transcription complete: {transcription}");
                            let _ = session.text(transcription).await;
                        }
                        Err(err) => log::error!("transcription failed: {err:?}"),
                    }
                }
                Err(err) => {
                    log::error!("Received a websocket message that caused error: {:?}", err)
                }
                _ => {}
            }
        }
    });
    Ok(res)
}

/// Decodes Opus/WebM audio, extracts log-mel features, and runs a single
/// hypothesis (`beam_size = 1`) transcription pass — the demo server's
/// replacement for the teacher's single-sequence `transcribe()`.
async fn transcribe(state: &AppState, payload: Vec<u8>) -> anyhow::Result<String> {
    let (samples, _) = whisper_driver::audio::pcm_decode(Cursor::new(payload))?;
    let features = feature_extraction::extract_features(samples, &state.config, &candle_core::Device::Cpu)?;

    let prompt = vec![
        state.service.sot_id(),
        state.service.transcribe_id(),
        state.service.no_timestamps_id(),
    ];
    let options = WhisperOptions {
        beam_size: 1,
        num_hypotheses: 1,
        ..WhisperOptions::default()
    };

    let results = state
        .service
        .generate(features, PromptInput::Ids(vec![prompt]), options)
        .await?;
    let result = results
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("no transcription produced"))?;
    let tokens = result
        .sequences_ids
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("no hypothesis produced"))?;
    Ok(state.service.decode_text(&tokens)?)
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init_from_env(Env::default().default_filter_or("info"));

    let settings = Settings::from_env_or_default();

    let repo = whisper_repo::download(&settings.model_repo).expect("failed to download whisper repo");
    let config = repo.config().expect("failed to read model config");

    let mut drivers = Vec::with_capacity(settings.replica_count.max(1));
    for _ in 0..settings.replica_count.max(1) {
        let (model, vocab) = repo.load().expect("failed to load whisper model");
        let device = default_device().expect("failed to select a device");
        drivers.push(WhisperDriver::new(model, vocab, device));
    }

    let state = web::Data::new(AppState {
        service: WhisperService::spawn(drivers),
        config,
    });

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .route("/", web::get().to(websocket_server))
            .wrap(Logger::default())
    })
    .bind((settings.bind_address.as_str(), settings.bind_port))?
    .run()
    .await
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use actix_http::ws;
    use actix_web::web::Bytes;
    use futures_util::SinkExt as _;

    fn test_state() -> web::Data<AppState> {
        let repo = whisper_repo::download(whisper_driver::config::REPO_ID).expect("download repo");
        let config = repo.config().expect("read config");
        let (model, vocab) = repo.load().expect("load model");
        let device = default_device().expect("select device");
        let driver = WhisperDriver::new(model, vocab, device);
        web::Data::new(AppState {
            service: WhisperService::spawn(vec![driver]),
            config,
        })
    }

    #[actix_web::test]
    #[ignore = "downloads real model weights; run explicitly with network access"]
    async fn test_websocket_transcribes_binary_message() {
        let state = test_state();
        let mut server = actix_test::start(move || {
            App::new()
                .app_data(state.clone())
                .route("/", web::get().to(websocket_server))
        });
        let mut socket = server.ws().await.unwrap();
        socket
            .send(ws::Message::Binary(
                fs::read("./test_data/english/complete_book_of_cheese_mono.webm")
                    .unwrap()
                    .into(),
            ))
            .await
            .unwrap();
        let item = socket.next().await.unwrap().unwrap();
        assert_eq!(
            item,
            ws::Frame::Text(Bytes::from_static(
                b" The Complete Book of Cheese by Robert Carlton Brown"
            ))
        );
    }
}
