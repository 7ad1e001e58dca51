use std::{convert::Infallible, net::SocketAddr};
use warp::Filter;

use crate::controllers::QuizController;
use crate::models::VisitorIdentity;

/// Stand-in address when no usable identity can be derived. Gating then
/// degrades to the device marker alone.
pub const PLACEHOLDER_IP: &str = "0.0.0.0";

pub fn with_controller(
    controller: QuizController,
) -> impl Filter<Extract = (QuizController,), Error = Infallible> + Clone {
    warp::any().map(move || controller.clone())
}

/// Best-effort visitor identity: first hop of `x-forwarded-for`, else the
/// socket peer, else the placeholder. The optional `x-device-id` header
/// carries the per-browser token.
pub fn visitor_identity(
) -> impl Filter<Extract = (VisitorIdentity,), Error = warp::Rejection> + Clone {
    warp::header::optional::<String>("x-forwarded-for")
        .and(warp::addr::remote())
        .and(warp::header::optional::<String>("x-device-id"))
        .map(
            |forwarded: Option<String>, addr: Option<SocketAddr>, device: Option<String>| {
                let ip = forwarded
                    .as_deref()
                    .and_then(|raw| raw.split(',').next())
                    .map(|hop| hop.trim().to_owned())
                    .filter(|hop| !hop.is_empty())
                    .or_else(|| addr.map(|addr| addr.ip().to_string()))
                    .unwrap_or_else(|| PLACEHOLDER_IP.to_owned());

                VisitorIdentity::new(ip, device)
            },
        )
}
