use axum::{
    debug_handler,
    extract::Query,
    response::{IntoResponse, Redirect},
    Form,
};
use serde::Deserialize;
use tower_sessions::Session;
use uuid::Uuid;

use crate::{error::AppResult, models::Identity};

pub const USER_ID: &str = "user_id";
pub const USER_NAME: &str = "user_name";

/// The identity stored in the cookie session, if the visitor signed in.
pub async fn resolve(session: &Session) -> Option<Identity> {
    let fetched = async {
        let id = session.get::<Uuid>(USER_ID).await?;
        let name = session.get::<String>(USER_NAME).await?;
        Ok::<_, tower_sessions::session::Error>(id.zip(name))
    };

    match fetched.await {
        Ok(found) => found.map(|(id, name)| Identity { id, name }),
        Err(err) => {
            tracing::warn!(error = %err, "failed to read session");
            None
        }
    }
}

#[derive(Deserialize)]
pub(crate) struct LoginForm {
    pub(crate) name: String,
    pub(crate) return_url: Option<String>,
}

/// Signs the visitor in under `name` with a fresh user id.
#[debug_handler]
pub(crate) async fn login(
    session: Session,
    Form(LoginForm { name, return_url }): Form<LoginForm>,
) -> AppResult<impl IntoResponse> {
    let name = name.trim();
    if name.is_empty() {
        return Err(anyhow::anyhow!("name cannot be empty").into());
    }

    let id = Uuid::now_v7();
    session.cycle_id().await?;
    session.insert(USER_ID, id).await?;
    session.insert(USER_NAME, name).await?;
    tracing::info!(user_id = %id, user_name = name, "signed in");

    Ok(Redirect::to(return_url.as_deref().unwrap_or("/")))
}

#[derive(Deserialize)]
pub(crate) struct LogoutQuery {
    pub(crate) return_url: Option<String>,
}

#[debug_handler]
pub(crate) async fn logout(
    Query(LogoutQuery { return_url }): Query<LogoutQuery>,
    session: Session,
) -> AppResult<Redirect> {
    session.flush().await?;
    Ok(Redirect::to(return_url.as_deref().unwrap_or("/")))
}
