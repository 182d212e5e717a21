// Account registry: credentials, verification, sessions, and per-account
// document storage.
//
// Accounts are keyed by email. Passwords are stored as PBKDF2-HMAC-SHA256
// hashes with a per-account random salt. Verification and password-reset
// codes are six random digits; email delivery is deployment-specific, so the
// service logs each issued code for the operator to relay. Session tokens
// are random 32-hex-character strings with an absolute expiry.
//
// Every public method returns the protocol's response-code enum for the
// matching operation; validation short-circuits in discriminant order so the
// first applicable code wins. The `Hub` owns the only instance and passes
// the caller's session identity in.

use std::collections::BTreeMap;
use std::num::NonZeroU32;
use std::time::{SystemTime, UNIX_EPOCH};

use ring::pbkdf2;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use driftsync_protocol::response::{
    BrowseCollectionCode, ChangePasswordCode, ChangeUsernameCode, CreateAccountCode,
    DeleteAccountCode, DeleteDocumentCode, GetDocumentCode, HasDocumentCode, IsVerifiedCode,
    LoginCode, LogoutCode, ReportUserCode, RequestPasswordResetCode, ResendVerificationCode,
    ResetPasswordCode, SetDocumentCode, SetExternalVisibleCode, VerifyAccountCode,
};

use crate::lobby::json_size;

pub const MIN_USERNAME: usize = 3;
pub const MAX_USERNAME: usize = 20;
pub const MIN_PASSWORD: usize = 8;
pub const MAX_PASSWORD: usize = 64;

const RESEND_COOLDOWN_SECS: u64 = 60;
const RESET_REQUEST_COOLDOWN_SECS: u64 = 60;
const CHANGE_PASSWORD_COOLDOWN_SECS: u64 = 60;
const CHANGE_USERNAME_COOLDOWN_SECS: u64 = 24 * 60 * 60;

const PBKDF2_ROUNDS: NonZeroU32 = NonZeroU32::new(100_000).unwrap();
const CREDENTIAL_LEN: usize = ring::digest::SHA256_OUTPUT_LEN;

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn random_digits(count: usize) -> String {
    (0..count).map(|_| fastrand::digit(10)).collect()
}

fn random_token() -> String {
    (0..32).map(|_| fastrand::digit(16)).collect()
}

/// Salted PBKDF2 hash of a password. The salt and hash travel through
/// persistence as raw byte arrays.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct PasswordHash {
    salt: Vec<u8>,
    hash: Vec<u8>,
}

impl PasswordHash {
    fn derive(password: &str) -> Self {
        let mut salt = vec![0u8; 16];
        for byte in &mut salt {
            *byte = fastrand::u8(..);
        }
        let mut hash = vec![0u8; CREDENTIAL_LEN];
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA256,
            PBKDF2_ROUNDS,
            &salt,
            password.as_bytes(),
            &mut hash,
        );
        Self { salt, hash }
    }

    fn verify(&self, password: &str) -> bool {
        pbkdf2::verify(
            pbkdf2::PBKDF2_HMAC_SHA256,
            PBKDF2_ROUNDS,
            &self.salt,
            password.as_bytes(),
            &self.hash,
        )
        .is_ok()
    }
}

/// A verification or reset code with its issue time, for expiry checks.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct IssuedCode {
    code: String,
    issued_unix: u64,
}

impl IssuedCode {
    fn issue() -> Self {
        Self {
            code: random_digits(6),
            issued_unix: now_unix(),
        }
    }

    fn expired(&self, valid_time: f64) -> bool {
        now_unix() > self.issued_unix.saturating_add(valid_time.max(0.0) as u64)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Session {
    token: String,
    expires_unix: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Report {
    pub reporter: String,
    pub text: String,
}

/// One stored player document. Externally visible documents can be read by
/// other logged-in players.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub value: Value,
    pub externally_visible: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Account {
    pub email: String,
    pub username: String,
    password: PasswordHash,
    pub verified: bool,
    pub banned: bool,
    verification: Option<IssuedCode>,
    reset: Option<IssuedCode>,
    sessions: Vec<Session>,
    pub reports: Vec<Report>,
    /// Operation name -> unix time of last use, for cooldowns.
    cooldowns: BTreeMap<String, u64>,
    /// Document path -> document. Paths are `/`-separated collections.
    pub documents: BTreeMap<String, Document>,
}

/// Tunable limits and switches for the account service.
#[derive(Clone, Debug)]
pub struct AccountPolicy {
    /// When false, accounts are created pre-verified and verification
    /// operations answer `VerificationDisabled` / succeed trivially.
    pub require_verification: bool,
    pub max_accounts: usize,
    /// Serialized-JSON byte budget for one account's documents combined.
    pub document_bytes_per_account: usize,
    pub max_report_len: usize,
    pub max_reports_per_reporter: usize,
    pub max_reports_per_account: usize,
}

impl Default for AccountPolicy {
    fn default() -> Self {
        Self {
            require_verification: false,
            max_accounts: 100_000,
            document_bytes_per_account: 256 * 1024,
            max_report_len: 500,
            max_reports_per_reporter: 5,
            max_reports_per_account: 100,
        }
    }
}

/// The account registry. All mutation goes through methods that track the
/// dirty flag for the persistence layer.
pub struct AccountService {
    accounts: BTreeMap<String, Account>,
    policy: AccountPolicy,
    dirty: bool,
}

fn email_valid(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.')
}

fn username_valid(username: &str) -> bool {
    username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Strips leading and trailing `/` so `a/b`, `/a/b`, and `a/b/` name the
/// same document.
fn normalize_path(path: &str) -> &str {
    path.trim_matches('/')
}

impl AccountService {
    pub fn new(policy: AccountPolicy) -> Self {
        Self {
            accounts: BTreeMap::new(),
            policy,
            dirty: false,
        }
    }

    pub fn restore(policy: AccountPolicy, accounts: BTreeMap<String, Account>) -> Self {
        Self {
            accounts,
            policy,
            dirty: false,
        }
    }

    /// Snapshot for the persistence layer.
    pub fn snapshot(&self) -> BTreeMap<String, Account> {
        self.accounts.clone()
    }

    /// Returns and clears the dirty flag.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    fn find_by_username(&self, username: &str) -> Option<&Account> {
        self.accounts.values().find(|a| a.username == username)
    }

    /// Username for a logged-in email, if the account still exists.
    pub fn username_for(&self, email: &str) -> Option<String> {
        self.accounts.get(email).map(|a| a.username.clone())
    }

    fn username_taken(&self, username: &str) -> bool {
        self.find_by_username(username).is_some()
    }

    fn on_cooldown(account: &Account, op: &str, cooldown_secs: u64) -> bool {
        account
            .cooldowns
            .get(op)
            .is_some_and(|last| now_unix() < last.saturating_add(cooldown_secs))
    }

    fn touch_cooldown(account: &mut Account, op: &str) {
        account.cooldowns.insert(op.to_string(), now_unix());
    }

    pub fn create_account(
        &mut self,
        email: &str,
        username: &str,
        password: &str,
    ) -> CreateAccountCode {
        if self.accounts.len() >= self.policy.max_accounts {
            return CreateAccountCode::StorageFull;
        }
        if !email_valid(email) {
            return CreateAccountCode::InvalidEmail;
        }
        if !username_valid(username) {
            return CreateAccountCode::InvalidUsername;
        }
        if self.accounts.contains_key(email) {
            return CreateAccountCode::EmailAlreadyExists;
        }
        if self.username_taken(username) {
            return CreateAccountCode::UsernameAlreadyExists;
        }
        if username.chars().count() < MIN_USERNAME {
            return CreateAccountCode::UsernameTooShort;
        }
        if username.chars().count() > MAX_USERNAME {
            return CreateAccountCode::UsernameTooLong;
        }
        if password.chars().count() < MIN_PASSWORD {
            return CreateAccountCode::PasswordTooShort;
        }
        if password.chars().count() > MAX_PASSWORD {
            return CreateAccountCode::PasswordTooLong;
        }

        let verification = if self.policy.require_verification {
            let code = IssuedCode::issue();
            log::info!("verification code for {email}: {}", code.code);
            Some(code)
        } else {
            None
        };
        let account = Account {
            email: email.to_string(),
            username: username.to_string(),
            password: PasswordHash::derive(password),
            verified: !self.policy.require_verification,
            banned: false,
            verification,
            reset: None,
            sessions: Vec::new(),
            reports: Vec::new(),
            cooldowns: BTreeMap::new(),
            documents: BTreeMap::new(),
        };
        self.accounts.insert(email.to_string(), account);
        self.dirty = true;
        log::info!("account created: {username} <{email}>");
        CreateAccountCode::Success
    }

    /// On success returns the removed account's username so callers can
    /// purge dependent state (leaderboard scores, live sessions).
    pub fn delete_account(
        &mut self,
        email: &str,
        password: &str,
    ) -> (DeleteAccountCode, Option<String>) {
        let credentials_ok = self
            .accounts
            .get(email)
            .is_some_and(|a| a.password.verify(password));
        if !credentials_ok {
            return (DeleteAccountCode::EmailOrPasswordIncorrect, None);
        }
        let removed = self.accounts.remove(email);
        self.dirty = true;
        log::info!("account deleted: {email}");
        (DeleteAccountCode::Success, removed.map(|a| a.username))
    }

    pub fn verify_account(&mut self, email: &str, code: &str, valid_time: f64) -> VerifyAccountCode {
        let Some(account) = self.accounts.get_mut(email) else {
            return VerifyAccountCode::IncorrectCode;
        };
        if account.banned {
            return VerifyAccountCode::Banned;
        }
        if account.verified {
            return VerifyAccountCode::AlreadyVerified;
        }
        let Some(issued) = &account.verification else {
            return VerifyAccountCode::IncorrectCode;
        };
        if issued.code != code {
            return VerifyAccountCode::IncorrectCode;
        }
        if issued.expired(valid_time) {
            return VerifyAccountCode::CodeExpired;
        }
        account.verified = true;
        account.verification = None;
        self.dirty = true;
        log::info!("account verified: {email}");
        VerifyAccountCode::Success
    }

    pub fn resend_verification(&mut self, email: &str, password: &str) -> ResendVerificationCode {
        if !self.policy.require_verification {
            return ResendVerificationCode::VerificationDisabled;
        }
        let Some(account) = self.accounts.get_mut(email) else {
            return ResendVerificationCode::EmailOrPasswordIncorrect;
        };
        if !account.password.verify(password) {
            return ResendVerificationCode::EmailOrPasswordIncorrect;
        }
        if account.banned {
            return ResendVerificationCode::Banned;
        }
        if account.verified {
            return ResendVerificationCode::AlreadyVerified;
        }
        if Self::on_cooldown(account, "resend", RESEND_COOLDOWN_SECS) {
            return ResendVerificationCode::OnCooldown;
        }
        let code = IssuedCode::issue();
        log::info!("verification code for {email}: {}", code.code);
        account.verification = Some(code);
        Self::touch_cooldown(account, "resend");
        self.dirty = true;
        ResendVerificationCode::Success
    }

    /// Empty `username` asks about the logged-in account itself.
    pub fn is_verified(&self, session: Option<&str>, username: &str) -> (IsVerifiedCode, bool) {
        if username.is_empty() {
            return match session.and_then(|email| self.accounts.get(email)) {
                Some(account) => (IsVerifiedCode::Success, account.verified),
                None => (IsVerifiedCode::NotLoggedIn, false),
            };
        }
        match self.find_by_username(username) {
            Some(account) => (IsVerifiedCode::Success, account.verified),
            None => (IsVerifiedCode::UserDoesntExist, false),
        }
    }

    /// On success returns (email, session token, username). The token is
    /// newly issued and expires after `valid_time` seconds.
    pub fn login(
        &mut self,
        email: &str,
        password: &str,
        valid_time: f64,
    ) -> (LoginCode, Option<(String, String, String)>) {
        let Some(account) = self.accounts.get_mut(email) else {
            return (LoginCode::EmailOrPasswordIncorrect, None);
        };
        if !account.password.verify(password) {
            return (LoginCode::EmailOrPasswordIncorrect, None);
        }
        if account.banned {
            return (LoginCode::Banned, None);
        }
        if !account.verified {
            return (LoginCode::NotVerified, None);
        }
        let token = random_token();
        let now = now_unix();
        account.sessions.retain(|s| s.expires_unix > now);
        account.sessions.push(Session {
            token: token.clone(),
            expires_unix: now.saturating_add(valid_time.max(0.0) as u64),
        });
        self.dirty = true;
        log::info!("login: {email}");
        (
            LoginCode::Success,
            Some((account.email.clone(), token, account.username.clone())),
        )
    }

    /// Resumes a previous session by token. Extends the session's expiry by
    /// `valid_time` seconds on success.
    pub fn login_from_session(
        &mut self,
        token: &str,
        valid_time: f64,
    ) -> (LoginCode, Option<(String, String, String)>) {
        let now = now_unix();
        let Some(account) = self
            .accounts
            .values_mut()
            .find(|a| a.sessions.iter().any(|s| s.token == token))
        else {
            return (LoginCode::ExpiredSession, None);
        };
        if account.banned {
            return (LoginCode::Banned, None);
        }
        let Some(session) = account
            .sessions
            .iter_mut()
            .find(|s| s.token == token && s.expires_unix > now)
        else {
            account.sessions.retain(|s| s.expires_unix > now);
            return (LoginCode::ExpiredSession, None);
        };
        session.expires_unix = now.saturating_add(valid_time.max(0.0) as u64);
        self.dirty = true;
        log::info!("session resumed: {}", account.email);
        (
            LoginCode::Success,
            Some((
                account.email.clone(),
                token.to_string(),
                account.username.clone(),
            )),
        )
    }

    pub fn logout(&mut self, session: Option<(&str, &str)>) -> LogoutCode {
        let Some((email, token)) = session else {
            return LogoutCode::NotLoggedIn;
        };
        let Some(account) = self.accounts.get_mut(email) else {
            return LogoutCode::NotLoggedIn;
        };
        account.sessions.retain(|s| s.token != token);
        self.dirty = true;
        LogoutCode::Success
    }

    /// On success returns (old username, new username) so callers can
    /// migrate username-keyed state.
    pub fn change_username(
        &mut self,
        session: Option<&str>,
        new_username: &str,
    ) -> (ChangeUsernameCode, Option<(String, String)>) {
        let Some(email) = session else {
            return (ChangeUsernameCode::NotLoggedIn, None);
        };
        let Some(current) = self.accounts.get(email) else {
            return (ChangeUsernameCode::NotLoggedIn, None);
        };
        if Self::on_cooldown(current, "change_username", CHANGE_USERNAME_COOLDOWN_SECS) {
            return (ChangeUsernameCode::OnCooldown, None);
        }
        if self
            .find_by_username(new_username)
            .is_some_and(|a| a.email != email)
        {
            return (ChangeUsernameCode::UsernameAlreadyExists, None);
        }
        if new_username.chars().count() < MIN_USERNAME {
            return (ChangeUsernameCode::UsernameTooShort, None);
        }
        if new_username.chars().count() > MAX_USERNAME {
            return (ChangeUsernameCode::UsernameTooLong, None);
        }
        if !username_valid(new_username) {
            return (ChangeUsernameCode::InvalidUsername, None);
        }
        // Presence checked above.
        let Some(account) = self.accounts.get_mut(email) else {
            return (ChangeUsernameCode::NotLoggedIn, None);
        };
        let old = std::mem::replace(&mut account.username, new_username.to_string());
        Self::touch_cooldown(account, "change_username");
        self.dirty = true;
        log::info!("username changed: {old} -> {new_username}");
        (
            ChangeUsernameCode::Success,
            Some((old, new_username.to_string())),
        )
    }

    /// Requires the current password; does not require a login session.
    /// Invalidates all existing sessions.
    pub fn change_password(
        &mut self,
        email: &str,
        password: &str,
        new_password: &str,
    ) -> ChangePasswordCode {
        let Some(account) = self.accounts.get_mut(email) else {
            return ChangePasswordCode::EmailOrPasswordIncorrect;
        };
        if Self::on_cooldown(account, "change_password", CHANGE_PASSWORD_COOLDOWN_SECS) {
            return ChangePasswordCode::OnCooldown;
        }
        if !account.password.verify(password) {
            return ChangePasswordCode::EmailOrPasswordIncorrect;
        }
        if account.banned {
            return ChangePasswordCode::Banned;
        }
        if !account.verified {
            return ChangePasswordCode::NotVerified;
        }
        account.password = PasswordHash::derive(new_password);
        account.sessions.clear();
        Self::touch_cooldown(account, "change_password");
        self.dirty = true;
        log::info!("password changed: {email}");
        ChangePasswordCode::Success
    }

    pub fn request_password_reset(&mut self, email: &str) -> RequestPasswordResetCode {
        let Some(account) = self.accounts.get_mut(email) else {
            return RequestPasswordResetCode::EmailDoesntExist;
        };
        if account.banned {
            return RequestPasswordResetCode::Banned;
        }
        if Self::on_cooldown(account, "reset_request", RESET_REQUEST_COOLDOWN_SECS) {
            return RequestPasswordResetCode::OnCooldown;
        }
        let code = IssuedCode::issue();
        log::info!("password reset code for {email}: {}", code.code);
        account.reset = Some(code);
        Self::touch_cooldown(account, "reset_request");
        self.dirty = true;
        RequestPasswordResetCode::Success
    }

    /// Reset codes stay valid for fifteen minutes. Invalidates all existing
    /// sessions on success.
    pub fn reset_password(
        &mut self,
        email: &str,
        reset_code: &str,
        new_password: &str,
    ) -> ResetPasswordCode {
        const RESET_CODE_VALID_SECS: f64 = 15.0 * 60.0;
        let Some(account) = self.accounts.get_mut(email) else {
            return ResetPasswordCode::EmailOrCodeIncorrect;
        };
        let Some(issued) = &account.reset else {
            return ResetPasswordCode::EmailOrCodeIncorrect;
        };
        if issued.code != reset_code {
            return ResetPasswordCode::EmailOrCodeIncorrect;
        }
        if issued.expired(RESET_CODE_VALID_SECS) {
            return ResetPasswordCode::CodeExpired;
        }
        account.password = PasswordHash::derive(new_password);
        account.reset = None;
        account.sessions.clear();
        self.dirty = true;
        log::info!("password reset: {email}");
        ResetPasswordCode::Success
    }

    pub fn report_account(
        &mut self,
        session: Option<&str>,
        username: &str,
        report: &str,
    ) -> ReportUserCode {
        let Some(reporter_email) = session else {
            return ReportUserCode::NotLoggedIn;
        };
        let Some(reporter) = self.accounts.get(reporter_email).map(|a| a.username.clone()) else {
            return ReportUserCode::NotLoggedIn;
        };
        if report.chars().count() > self.policy.max_report_len {
            return ReportUserCode::ReportTooLong;
        }
        let max_per_reporter = self.policy.max_reports_per_reporter;
        let max_per_account = self.policy.max_reports_per_account;
        let Some(target) = self.accounts.values_mut().find(|a| a.username == username) else {
            return ReportUserCode::UserDoesntExist;
        };
        if target.reports.len() >= max_per_account {
            return ReportUserCode::StorageFull;
        }
        let from_reporter = target
            .reports
            .iter()
            .filter(|r| r.reporter == reporter)
            .count();
        if from_reporter >= max_per_reporter {
            return ReportUserCode::TooManyReports;
        }
        target.reports.push(Report {
            reporter,
            text: report.to_string(),
        });
        self.dirty = true;
        log::info!("report filed against {username}");
        ReportUserCode::Success
    }

    fn document_bytes(account: &Account) -> usize {
        account.documents.values().map(json_size).sum()
    }

    pub fn set_document(
        &mut self,
        session: Option<&str>,
        path: &str,
        document: Value,
        externally_visible: bool,
    ) -> SetDocumentCode {
        let budget = self.policy.document_bytes_per_account;
        let Some(account) = session.and_then(|email| self.accounts.get_mut(email)) else {
            return SetDocumentCode::NotLoggedIn;
        };
        let path = normalize_path(path).to_string();
        let replaced = account
            .documents
            .get(&path)
            .map(json_size)
            .unwrap_or_default();
        let new_doc = Document {
            value: document,
            externally_visible,
        };
        let projected = Self::document_bytes(account) - replaced + json_size(&new_doc);
        if projected > budget {
            return SetDocumentCode::StorageFull;
        }
        account.documents.insert(path, new_doc);
        self.dirty = true;
        SetDocumentCode::Success
    }

    pub fn set_externally_visible(
        &mut self,
        session: Option<&str>,
        path: &str,
        externally_visible: bool,
    ) -> SetExternalVisibleCode {
        let Some(account) = session.and_then(|email| self.accounts.get_mut(email)) else {
            return SetExternalVisibleCode::NotLoggedIn;
        };
        let Some(doc) = account.documents.get_mut(normalize_path(path)) else {
            return SetExternalVisibleCode::DoesntExist;
        };
        doc.externally_visible = externally_visible;
        self.dirty = true;
        SetExternalVisibleCode::Success
    }

    pub fn get_document(
        &self,
        session: Option<&str>,
        path: &str,
    ) -> (GetDocumentCode, Option<Value>) {
        let Some(account) = session.and_then(|email| self.accounts.get(email)) else {
            return (GetDocumentCode::NotLoggedIn, None);
        };
        match account.documents.get(normalize_path(path)) {
            Some(doc) => (GetDocumentCode::Success, Some(doc.value.clone())),
            None => (GetDocumentCode::DoesntExist, None),
        }
    }

    pub fn has_document(&self, session: Option<&str>, path: &str) -> (HasDocumentCode, bool) {
        let Some(account) = session.and_then(|email| self.accounts.get(email)) else {
            return (HasDocumentCode::NotLoggedIn, false);
        };
        (
            HasDocumentCode::Success,
            account.documents.contains_key(normalize_path(path)),
        )
    }

    /// Lists the immediate children of a collection: document names and
    /// sub-collection names (suffixed with `/`), without descending further.
    pub fn browse_collection(
        &self,
        session: Option<&str>,
        path: &str,
    ) -> (BrowseCollectionCode, Vec<String>) {
        let Some(account) = session.and_then(|email| self.accounts.get(email)) else {
            return (BrowseCollectionCode::NotLoggedIn, Vec::new());
        };
        Self::browse(account, path, false)
    }

    pub fn delete_document(&mut self, session: Option<&str>, path: &str) -> DeleteDocumentCode {
        let Some(account) = session.and_then(|email| self.accounts.get_mut(email)) else {
            return DeleteDocumentCode::NotLoggedIn;
        };
        if account.documents.remove(normalize_path(path)).is_none() {
            return DeleteDocumentCode::DoesntExist;
        }
        self.dirty = true;
        DeleteDocumentCode::Success
    }

    /// Reads another player's document; only externally visible documents
    /// exist from the outside.
    pub fn get_external_document(
        &self,
        session: Option<&str>,
        username: &str,
        path: &str,
    ) -> (GetDocumentCode, Option<Value>) {
        if session.is_none() {
            return (GetDocumentCode::NotLoggedIn, None);
        }
        let Some(account) = self.find_by_username(username) else {
            return (GetDocumentCode::DoesntExist, None);
        };
        match account.documents.get(normalize_path(path)) {
            Some(doc) if doc.externally_visible => {
                (GetDocumentCode::Success, Some(doc.value.clone()))
            }
            _ => (GetDocumentCode::DoesntExist, None),
        }
    }

    pub fn has_external_document(
        &self,
        session: Option<&str>,
        username: &str,
        path: &str,
    ) -> (HasDocumentCode, bool) {
        if session.is_none() {
            return (HasDocumentCode::NotLoggedIn, false);
        }
        let exists = self.find_by_username(username).is_some_and(|account| {
            account
                .documents
                .get(normalize_path(path))
                .is_some_and(|doc| doc.externally_visible)
        });
        (HasDocumentCode::Success, exists)
    }

    pub fn browse_external_collection(
        &self,
        session: Option<&str>,
        username: &str,
        path: &str,
    ) -> (BrowseCollectionCode, Vec<String>) {
        if session.is_none() {
            return (BrowseCollectionCode::NotLoggedIn, Vec::new());
        }
        let Some(account) = self.find_by_username(username) else {
            return (BrowseCollectionCode::DoesntExist, Vec::new());
        };
        Self::browse(account, path, true)
    }

    fn browse(
        account: &Account,
        path: &str,
        external_only: bool,
    ) -> (BrowseCollectionCode, Vec<String>) {
        let prefix = normalize_path(path);
        let mut entries = Vec::new();
        let mut any_under_prefix = false;
        for (doc_path, doc) in &account.documents {
            let rest = if prefix.is_empty() {
                doc_path.as_str()
            } else {
                match doc_path.strip_prefix(prefix).and_then(|r| r.strip_prefix('/')) {
                    Some(rest) => rest,
                    None => continue,
                }
            };
            any_under_prefix = true;
            if external_only && !doc.externally_visible {
                continue;
            }
            let entry = match rest.split_once('/') {
                Some((collection, _)) => format!("{collection}/"),
                None => rest.to_string(),
            };
            if !entries.contains(&entry) {
                entries.push(entry);
            }
        }
        if !prefix.is_empty() && !any_under_prefix {
            return (BrowseCollectionCode::DoesntExist, Vec::new());
        }
        (BrowseCollectionCode::Success, entries)
    }

    #[cfg(test)]
    fn verification_code(&self, email: &str) -> Option<String> {
        self.accounts
            .get(email)?
            .verification
            .as_ref()
            .map(|c| c.code.clone())
    }

    #[cfg(test)]
    fn reset_code(&self, email: &str) -> Option<String> {
        self.accounts.get(email)?.reset.as_ref().map(|c| c.code.clone())
    }

    #[cfg(test)]
    fn backdate_verification(&mut self, email: &str, secs: u64) {
        if let Some(code) = self
            .accounts
            .get_mut(email)
            .and_then(|a| a.verification.as_mut())
        {
            code.issued_unix = code.issued_unix.saturating_sub(secs);
        }
    }

    #[cfg(test)]
    fn clear_cooldown(&mut self, email: &str, op: &str) {
        if let Some(account) = self.accounts.get_mut(email) {
            account.cooldowns.remove(op);
        }
    }
}
