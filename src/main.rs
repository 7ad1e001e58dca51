use anyhow::{anyhow, Context, Result};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::{env, net::SocketAddr};
use tokio::fs;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use warp::{
    http::StatusCode,
    reject,
    reply::{self, Reply},
    Filter,
};

use backend::{Backend, LocalStore, RemoteStore};
use clock::Clock;
use controllers::{AnswerOutcome, DayState, EntryOutcome, QuizController};
use markers::MarkerStore;
use models::{BackendConfig, Config, Phase, VisitorIdentity, WindowConfig};

mod backend;
mod clock;
mod controllers;
mod filters;
mod markers;
mod models;

#[derive(Clone, Debug, Serialize)]
struct StateReply<'a> {
    phase: Phase,
    day_label: String,
    window_label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    question: Option<QuestionReply<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    winner: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    notice: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
struct QuestionReply<'a> {
    question: &'a str,
    choices: Vec<&'a str>,
}

#[derive(Clone, Debug, Deserialize)]
struct AnswerRequest {
    choice: usize,
}

#[derive(Clone, Debug, Serialize)]
struct AnswerReply {
    correct: bool,
    feedback: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    notice: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
struct EntryRequest {
    name: String,
}

#[derive(Clone, Debug, Serialize)]
struct EntryReply {
    message: String,
}

#[derive(Clone, Debug, Serialize)]
struct ArchiveRowReply {
    day_index: u32,
    name: String,
}

#[derive(Clone, Debug, Serialize)]
struct ErrorReply {
    error: ErrorCode,
}

#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
enum ErrorCode {
    AlreadyPlayed,
    Closed,
    EmptyName,
    Backend,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_err| EnvFilter::new("info")))
        .init();

    let bind_addr = env::var("BIND").unwrap_or_else(|_err| "127.0.0.1:3030".into());
    let bind_addr: SocketAddr = bind_addr.parse()?;

    let cors_origin = env::var("CORS_ORIGIN").unwrap_or_else(|_err| "http://localhost:1313".into());

    let config_path = env::var("QUIZ_CONFIG").unwrap_or_else(|_err| "quiz.toml".into());
    let config = fs::read_to_string(&config_path)
        .await
        .with_context(|| format!("reading {}", config_path))?;
    let config: Config = toml::de::from_str(&config)?;

    let tz: Tz = config
        .window
        .tz
        .parse()
        .map_err(|err| anyhow!("unknown timezone '{}': {}", config.window.tz, err))?;
    let clock = match &config.dev.override_path {
        Some(path) => {
            info!(path = %path.display(), "clock override enabled, do not ship this config");
            Clock::with_override_path(tz, path)
        }
        None => Clock::new(tz),
    };

    let backend = match &config.backend {
        BackendConfig::Local { dir } => Backend::Local(LocalStore::open(dir)?),
        BackendConfig::Remote { endpoint } => Backend::Remote(RemoteStore::new(endpoint.clone())),
    };
    let markers = MarkerStore::open(&config.markers_path)?;

    let controller = QuizController::new(
        config.window.clone(),
        config.questions.clone(),
        clock,
        backend,
        markers,
    )?;

    let state = warp::path!("api" / "state")
        .and(warp::get())
        .and(filters::visitor_identity())
        .and(filters::with_controller(controller.clone()))
        .and_then(
            |identity: VisitorIdentity, controller: QuizController| async move {
                let response = match controller.state(&identity).await {
                    Ok(state) => {
                        let window = controller.window();
                        let reply = StateReply {
                            phase: state.phase,
                            day_label: format!("Day {} of {}", state.day_number, window.total_days),
                            window_label: format!(
                                "Today: {:02}:00-{:02}:00 ({})",
                                window.open_hour, window.close_hour, window.tz
                            ),
                            question: state.question.as_ref().map(|question| QuestionReply {
                                question: &question.question,
                                choices: question.choices.iter().map(String::as_str).collect(),
                            }),
                            winner: state.winner.as_ref().map(|winner| winner.name.as_str()),
                            notice: notice_for(&state, window),
                        };

                        reply::json(&reply).into_response()
                    }
                    Err(err) => backend_error(err),
                };

                Ok::<_, reject::Rejection>(response)
            },
        );

    let answer = warp::path!("api" / "answer")
        .and(warp::post())
        .and(warp::filters::body::json())
        .and(filters::visitor_identity())
        .and(filters::with_controller(controller.clone()))
        .and_then(
            |body: AnswerRequest, identity: VisitorIdentity, controller: QuizController| async move {
                let response = match controller.answer(&identity, body.choice).await {
                    Ok(AnswerOutcome::Scored { correct, explain }) => {
                        let window = controller.window();
                        let reply = if correct {
                            AnswerReply {
                                correct,
                                feedback: "Correct. Nice work.".into(),
                                notice: None,
                            }
                        } else {
                            AnswerReply {
                                correct,
                                feedback: format!(
                                    "Not quite. {}",
                                    explain.unwrap_or_default()
                                ),
                                notice: Some(format!(
                                    "Come back tomorrow at {:02}:00 for another go.",
                                    window.open_hour
                                )),
                            }
                        };

                        reply::json(&reply).into_response()
                    }
                    Ok(AnswerOutcome::AlreadyPlayed) => reply::with_status(
                        reply::json(&ErrorReply {
                            error: ErrorCode::AlreadyPlayed,
                        }),
                        StatusCode::CONFLICT,
                    )
                    .into_response(),
                    Ok(AnswerOutcome::NotOpen) => reply::with_status(
                        reply::json(&ErrorReply {
                            error: ErrorCode::Closed,
                        }),
                        StatusCode::CONFLICT,
                    )
                    .into_response(),
                    Err(err) => backend_error(err),
                };

                Ok::<_, reject::Rejection>(response)
            },
        );

    let entry = warp::path!("api" / "entry")
        .and(warp::post())
        .and(warp::filters::body::json())
        .and(filters::visitor_identity())
        .and(filters::with_controller(controller.clone()))
        .and_then(
            |body: EntryRequest, identity: VisitorIdentity, controller: QuizController| async move {
                let response = match controller.submit_entry(&identity, &body.name).await {
                    Ok(EntryOutcome::Recorded) => {
                        let window = controller.window();
                        let reply = EntryReply {
                            message: format!(
                                "Thanks! Your name is in today's draw. Check back after {:02}:00 to see who won.",
                                window.close_hour
                            ),
                        };

                        reply::json(&reply).into_response()
                    }
                    Ok(EntryOutcome::WriteFailed) => reply::with_status(
                        reply::json(&EntryReply {
                            message: "Sorry, there was a problem saving your entry. Please try again later."
                                .into(),
                        }),
                        StatusCode::BAD_GATEWAY,
                    )
                    .into_response(),
                    Ok(EntryOutcome::EmptyName) => reply::with_status(
                        reply::json(&ErrorReply {
                            error: ErrorCode::EmptyName,
                        }),
                        StatusCode::UNPROCESSABLE_ENTITY,
                    )
                    .into_response(),
                    Ok(EntryOutcome::NotOpen) => reply::with_status(
                        reply::json(&ErrorReply {
                            error: ErrorCode::Closed,
                        }),
                        StatusCode::CONFLICT,
                    )
                    .into_response(),
                    Err(err) => backend_error(err),
                };

                Ok::<_, reject::Rejection>(response)
            },
        );

    let archive = warp::path!("api" / "archive")
        .and(warp::get())
        .and(filters::with_controller(controller.clone()))
        .and_then(|controller: QuizController| async move {
            let response = match controller.archive().await {
                Ok(rows) => {
                    let rows: Vec<ArchiveRowReply> = rows
                        .into_iter()
                        .map(|(day_index, winner)| ArchiveRowReply {
                            day_index,
                            name: winner.name,
                        })
                        .collect();

                    reply::json(&rows).into_response()
                }
                Err(err) => backend_error(err),
            };

            Ok::<_, reject::Rejection>(response)
        });

    let cors = warp::cors()
        .allow_origin(cors_origin.as_str())
        .allow_methods(vec!["GET", "POST"])
        .allow_headers(vec!["Content-Type", "X-Device-Id"]);

    let server = state.or(answer).or(entry).or(archive).with(cors);

    info!(%bind_addr, "daily draw quiz listening");
    warp::serve(server).run(bind_addr).await;

    Ok(())
}

fn notice_for(state: &DayState, window: &WindowConfig) -> Option<String> {
    match state.phase {
        Phase::NotStarted => Some(format!(
            "First question unlocks at {:02}:00 in {}. Check back then.",
            window.open_hour, window.tz
        )),
        Phase::Finished => Some(format!(
            "The {}-day quiz is complete. Thanks for playing.",
            window.total_days
        )),
        Phase::Waiting => Some(format!(
            "Today's question unlocks at {:02}:00. See you then.",
            window.open_hour
        )),
        Phase::Closed if state.no_entries => {
            Some("Entries are closed for today. No valid entries were recorded.".into())
        }
        Phase::Open if state.already_played => Some(format!(
            "You've already taken today's quiz on this connection. Back again tomorrow at {:02}:00 for a fresh question.",
            window.open_hour
        )),
        _ => None,
    }
}

fn backend_error(err: anyhow::Error) -> warp::reply::Response {
    error!(error = %err, "backend call failed");
    reply::with_status(
        reply::json(&ErrorReply {
            error: ErrorCode::Backend,
        }),
        StatusCode::BAD_GATEWAY,
    )
    .into_response()
}
