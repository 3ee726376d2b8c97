use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    extract::{FromRef, State, rejection::JsonRejection},
    middleware,
    routing::{get, post},
};
use chrono::Utc;
use serde::Serialize;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info};

use crate::auth::{AuthUser, TokenSigner, hash_password, verify_password};
use crate::error::{
    ApiError, ApiErrorWithMeta, E_BAD_CREDENTIALS, E_BAD_ORDER_NUMBER, E_BAD_REQUEST, E_BAD_SUM,
    E_DB_FAILURE, E_INSUFFICIENT_FUNDS, E_LOGIN_TAKEN, E_ORDER_CONFLICT,
};
use crate::ledger::{self, LedgerError};
use crate::orders::{add_new_order, is_acceptable_number};
use crate::reconcile::Reconciler;
use crate::responses::{ApiOk, RequestMeta, meta_middleware};
use crate::store::{LedgerStore, OrderStore, StoreError, UserStore};
use crate::types::{
    AddOrderOutcome, Balance, CredentialsRequest, OrderResponse, User, WithdrawRequest, Withdrawal,
    WithdrawalResponse,
};

/// The application state.
#[derive(Clone)]
pub struct AppState {
    pub users: Arc<dyn UserStore>,
    pub orders: Arc<dyn OrderStore>,
    pub ledger: Arc<dyn LedgerStore>,
    /// Queues orders for accrual polling.
    pub reconciler: Reconciler,
    /// Issues and checks session tokens.
    pub signer: TokenSigner,
}

impl FromRef<AppState> for TokenSigner {
    fn from_ref(state: &AppState) -> Self {
        state.signer.clone()
    }
}

/// Body of register/login responses.
#[derive(Serialize)]
pub struct SessionResponse {
    pub login: String,
}

/// Body of an order upload response.
#[derive(Serialize)]
pub struct UploadResponse {
    pub number: String,
}

pub fn init_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/user/register", post(register_handler))
        .route("/api/user/login", post(login_handler))
        .route("/api/user/orders", post(upload_order_handler).get(list_orders_handler))
        .route("/api/user/balance", get(balance_handler))
        .route("/api/user/balance/withdraw", post(withdraw_handler))
        .route("/api/user/withdrawals", get(list_withdrawals_handler))
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(middleware::from_fn(meta_middleware))
}

/// Width of `mart_users.login`.
const MAX_LOGIN_LEN: usize = 72;

fn db_failure(e: StoreError, meta: &RequestMeta) -> ApiErrorWithMeta {
    ApiError::Internal(e.into())
        .with_meta(meta.clone())
        .with_code(E_DB_FAILURE)
}

fn bad_json(e: JsonRejection, meta: &RequestMeta) -> ApiErrorWithMeta {
    ApiError::BadRequest(e.body_text())
        .with_meta(meta.clone())
        .with_code(E_BAD_REQUEST)
}

fn checked_credentials(
    body: Result<Json<CredentialsRequest>, JsonRejection>,
    meta: &RequestMeta,
) -> Result<CredentialsRequest, ApiErrorWithMeta> {
    let Json(creds) = body.map_err(|e| bad_json(e, meta))?;
    if creds.login.trim().is_empty() || creds.password.is_empty() {
        return Err(ApiError::BadRequest("login and password are required".into())
            .with_meta(meta.clone())
            .with_code(E_BAD_REQUEST));
    }
    if creds.login.len() > MAX_LOGIN_LEN {
        return Err(ApiError::BadRequest(format!("login is longer than {MAX_LOGIN_LEN} bytes"))
            .with_meta(meta.clone())
            .with_code(E_BAD_REQUEST));
    }
    Ok(creds)
}

async fn register_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    body: Result<Json<CredentialsRequest>, JsonRejection>,
) -> Result<ApiOk<SessionResponse>, ApiErrorWithMeta> {
    let creds = checked_credentials(body, &meta)?;
    let user = User {
        login: creds.login.clone(),
        password_hash: hash_password(&creds.password),
    };

    let inserted = st.users.insert_user(&user).await.map_err(|e| db_failure(e, &meta))?;
    if !inserted {
        return Err(ApiError::Conflict(format!("login {} is already taken", creds.login))
            .with_meta(meta)
            .with_code(E_LOGIN_TAKEN));
    }
    info!(login = %creds.login, "user registered");

    let headers = st.signer.auth_headers(&creds.login);
    Ok(ApiOk::ok(SessionResponse { login: creds.login }).with_headers(headers))
}

async fn login_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    body: Result<Json<CredentialsRequest>, JsonRejection>,
) -> Result<ApiOk<SessionResponse>, ApiErrorWithMeta> {
    let creds = checked_credentials(body, &meta)?;
    let user = st.users.find_user(&creds.login).await.map_err(|e| db_failure(e, &meta))?;

    let valid = match &user {
        Some(u) => verify_password(&creds.password, &u.password_hash)
            .map_err(|e| ApiError::Internal(e.into()).with_meta(meta.clone()))?,
        None => false,
    };
    if !valid {
        return Err(ApiError::Unauthorized("wrong login or password".into())
            .with_meta(meta)
            .with_code(E_BAD_CREDENTIALS));
    }

    let headers = st.signer.auth_headers(&creds.login);
    Ok(ApiOk::ok(SessionResponse { login: creds.login }).with_headers(headers))
}

async fn upload_order_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    AuthUser(username): AuthUser,
    body: String,
) -> Result<ApiOk<UploadResponse>, ApiErrorWithMeta> {
    let number = body.trim();
    if number.is_empty() {
        return Err(ApiError::BadRequest("order number is required".into())
            .with_meta(meta)
            .with_code(E_BAD_REQUEST));
    }
    if !is_acceptable_number(number) {
        return Err(ApiError::Unprocessable(format!("order number {number} is not valid"))
            .with_meta(meta)
            .with_code(E_BAD_ORDER_NUMBER));
    }

    let outcome = add_new_order(st.orders.as_ref(), number, &username, Utc::now())
        .await
        .map_err(|e| db_failure(e, &meta))?;
    let data = UploadResponse {
        number: number.to_string(),
    };
    match outcome {
        AddOrderOutcome::Accepted => {
            st.reconciler.dispatch(number);
            Ok(ApiOk::accepted(data))
        }
        AddOrderOutcome::OwnedBySelf => Ok(ApiOk::ok(data)),
        AddOrderOutcome::OwnedByOther => Err(ApiError::Conflict("order uploaded by another user".into())
            .with_meta(meta)
            .with_code(E_ORDER_CONFLICT)),
    }
}

async fn list_orders_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    AuthUser(username): AuthUser,
) -> Result<ApiOk<Vec<OrderResponse>>, ApiErrorWithMeta> {
    let orders = st
        .orders
        .orders_for_user(&username)
        .await
        .map_err(|e| db_failure(e, &meta))?;
    if orders.is_empty() {
        return Ok(ApiOk::no_content());
    }

    for order in orders.iter().filter(|o| !o.status.is_terminal()) {
        st.reconciler.dispatch(&order.number);
    }

    let data = orders.into_iter().map(OrderResponse::from).collect();
    Ok(ApiOk::ok(data))
}

async fn balance_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    AuthUser(username): AuthUser,
) -> Result<ApiOk<Balance>, ApiErrorWithMeta> {
    let balance = ledger::get_balance(st.ledger.as_ref(), &username)
        .await
        .map_err(|e| db_failure(e, &meta))?;
    Ok(ApiOk::ok(balance))
}

async fn withdraw_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    AuthUser(username): AuthUser,
    body: Result<Json<WithdrawRequest>, JsonRejection>,
) -> Result<ApiOk<WithdrawalResponse>, ApiErrorWithMeta> {
    let Json(req) = body.map_err(|e| bad_json(e, &meta))?;
    if !is_acceptable_number(&req.order) {
        return Err(ApiError::Unprocessable(format!("order number {} is not valid", req.order))
            .with_meta(meta)
            .with_code(E_BAD_ORDER_NUMBER));
    }

    let withdrawal = Withdrawal {
        order: req.order,
        sum: req.sum,
        username,
        processed_at: Utc::now(),
    };
    let result = ledger::process_withdraw(st.ledger.as_ref(), &withdrawal).await;
    match result {
        Ok(()) => Ok(ApiOk::ok(withdrawal.into())),
        Err(e @ LedgerError::InsufficientFunds { .. }) => Err(ApiError::PaymentRequired(e.to_string())
            .with_meta(meta)
            .with_code(E_INSUFFICIENT_FUNDS)),
        Err(e @ (LedgerError::NonPositiveSum | LedgerError::TooPrecise(_))) => Err(ApiError::Unprocessable(e.to_string())
            .with_meta(meta)
            .with_code(E_BAD_SUM)),
        Err(LedgerError::Store(e)) => Err(db_failure(e, &meta)),
    }
}

async fn list_withdrawals_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    AuthUser(username): AuthUser,
) -> Result<ApiOk<Vec<WithdrawalResponse>>, ApiErrorWithMeta> {
    let withdrawals = st
        .ledger
        .withdrawals_for_user(&username)
        .await
        .map_err(|e| db_failure(e, &meta))?;
    if withdrawals.is_empty() {
        return Ok(ApiOk::no_content());
    }
    let data = withdrawals.into_iter().map(WithdrawalResponse::from).collect();
    Ok(ApiOk::ok(data))
}
