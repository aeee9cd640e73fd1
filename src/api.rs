use std::sync::Arc;

use serde::Serialize;

use crate::client::{ApiError, ApiRequest, Attachment, Client};
use crate::credentials::CredentialStore;
use crate::models::{
    AdminStats, AuditLogEntry, AuthSession, FlaggedUser, Issue, IssueStatus, LoginRequest,
    NearbyQuery, NewReport, Notification, Page, PageRequest, Rating, RatingRequest,
    RegisterRequest, StatusUpdate, TokenStatus, UserRatings,
};

/// Typed operations against the ALRIS backend.
pub struct Gateway {
    client: Arc<Client>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VerifyRequest<'a> {
    token: &'a str,
}

impl Gateway {
    pub fn new(client: Arc<Client>) -> Self {
        Self { client }
    }

    fn store(&self) -> &Arc<dyn CredentialStore> {
        self.client.store()
    }

    pub fn login(&self, email: &str, password: &str) -> Result<AuthSession, ApiError> {
        self.sign_in("/auth/login", email, password)
    }

    pub fn login_authority(&self, email: &str, password: &str) -> Result<AuthSession, ApiError> {
        self.sign_in("/auth/authority/login", email, password)
    }

    fn sign_in(&self, path: &str, email: &str, password: &str) -> Result<AuthSession, ApiError> {
        if email.trim().is_empty() || password.is_empty() {
            return Err(ApiError::InvalidRequest(
                "email and password are required".into(),
            ));
        }
        let req = ApiRequest::post(path).json(&LoginRequest {
            email: email.trim().to_string(),
            password: password.to_string(),
        })?;
        let session: AuthSession = self.client.call(&req)?;
        self.persist(&session)?;
        tracing::info!(user = %session.user.id, role = %session.user.role, "signed in");
        Ok(session)
    }

    pub fn register(&self, request: &RegisterRequest) -> Result<AuthSession, ApiError> {
        let req = ApiRequest::post("/auth/register").json(request)?;
        let session: AuthSession = self.client.call(&req)?;
        self.persist(&session)?;
        Ok(session)
    }

    pub fn verify_token(&self, token: &str) -> Result<TokenStatus, ApiError> {
        let req = ApiRequest::post("/auth/verify").json(&VerifyRequest { token })?;
        self.client.call(&req)
    }

    /// Forget the stored credentials. Local only; the backend keeps no
    /// session state to tear down.
    pub fn logout(&self) -> Result<(), ApiError> {
        self.store().clear().map_err(ApiError::Storage)?;
        tracing::info!("signed out");
        Ok(())
    }

    fn persist(&self, session: &AuthSession) -> Result<(), ApiError> {
        self.store()
            .write_pair(&session.access_token, &session.refresh_token)
            .map_err(ApiError::Storage)
    }

    pub fn create_report(
        &self,
        report: &NewReport,
        photos: Vec<Attachment>,
    ) -> Result<Issue, ApiError> {
        if report.title.trim().is_empty() {
            return Err(ApiError::InvalidRequest("report title is required".into()));
        }
        let mut fields = vec![
            ("title".to_string(), report.title.clone()),
            ("description".to_string(), report.description.clone()),
            ("category".to_string(), report.category.as_str().to_string()),
            ("latitude".to_string(), report.latitude.to_string()),
            ("longitude".to_string(), report.longitude.to_string()),
        ];
        if let Some(address) = &report.address {
            fields.push(("address".to_string(), address.clone()));
        }
        let req = ApiRequest::post("/reports").multipart(fields, photos);
        self.client.call(&req)
    }

    pub fn nearby_issues(&self, query: &NearbyQuery) -> Result<Page<Issue>, ApiError> {
        let mut req = ApiRequest::get("/issues/nearby")
            .query("lat", query.latitude)
            .query("lng", query.longitude);
        if let Some(radius) = query.radius_km {
            req = req.query("radius", radius);
        }
        let req = req.query_pairs(query.page.into_params());
        self.client.call(&req)
    }

    pub fn department_issues(
        &self,
        status: Option<IssueStatus>,
        page: PageRequest,
    ) -> Result<Page<Issue>, ApiError> {
        let mut req = ApiRequest::get("/issues/department");
        if let Some(status) = status {
            req = req.query("status", status.as_str());
        }
        let req = req.query_pairs(page.into_params());
        self.client.call(&req)
    }

    pub fn issue(&self, id: &str) -> Result<Issue, ApiError> {
        let req = ApiRequest::get(format!("/issues/{}", require_id(id)?));
        self.client.call(&req)
    }

    pub fn update_issue_status(&self, id: &str, update: &StatusUpdate) -> Result<Issue, ApiError> {
        let req = ApiRequest::patch(format!("/issues/{}/status", require_id(id)?)).json(update)?;
        self.client.call(&req)
    }

    pub fn delete_report(&self, id: &str) -> Result<(), ApiError> {
        let req = ApiRequest::delete(format!("/reports/{}", require_id(id)?));
        self.client.call_unit(&req)
    }

    pub fn rate_user(&self, rating: &RatingRequest) -> Result<Rating, ApiError> {
        if !(1..=5).contains(&rating.score) {
            return Err(ApiError::InvalidRequest(
                "rating score must be between 1 and 5".into(),
            ));
        }
        let req = ApiRequest::post("/ratings").json(rating)?;
        self.client.call(&req)
    }

    pub fn user_ratings(&self, user_id: &str) -> Result<UserRatings, ApiError> {
        let req = ApiRequest::get(format!("/ratings/users/{}", require_id(user_id)?));
        self.client.call(&req)
    }

    pub fn flagged_users(&self, page: PageRequest) -> Result<Page<FlaggedUser>, ApiError> {
        let req = ApiRequest::get("/users/flagged").query_pairs(page.into_params());
        self.client.call(&req)
    }

    pub fn notifications(&self, page: PageRequest) -> Result<Page<Notification>, ApiError> {
        let req = ApiRequest::get("/notifications").query_pairs(page.into_params());
        self.client.call(&req)
    }

    pub fn mark_notification_read(&self, id: &str) -> Result<(), ApiError> {
        let req = ApiRequest::patch(format!("/notifications/{}/read", require_id(id)?));
        self.client.call_unit(&req)
    }

    pub fn mark_all_notifications_read(&self) -> Result<(), ApiError> {
        self.client
            .call_unit(&ApiRequest::patch("/notifications/read-all"))
    }

    pub fn admin_stats(&self) -> Result<AdminStats, ApiError> {
        self.client.call(&ApiRequest::get("/admin/stats"))
    }

    pub fn audit_logs(&self, page: PageRequest) -> Result<Page<AuditLogEntry>, ApiError> {
        let req = ApiRequest::get("/admin/audit-logs").query_pairs(page.into_params());
        self.client.call(&req)
    }
}

/// An id must stay a single path segment once joined onto the base URL.
fn require_id(id: &str) -> Result<&str, ApiError> {
    let id = id.trim();
    if id.is_empty()
        || id == "."
        || id == ".."
        || id.contains(['/', '\\', '?', '#', '%'])
    {
        return Err(ApiError::InvalidRequest(format!("invalid id {:?}", id)));
    }
    Ok(id)
}
