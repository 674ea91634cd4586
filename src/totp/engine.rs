use crate::identity::{BackendToken, IdentityBackend, IdentityError, RecoveryQuestion};
use base64ct::{Base64, Encoding};
use image::{GrayImage, ImageFormat, Luma};
use qrcodegen::{QrCode, QrCodeEcc};
use std::{collections::HashMap, io::Cursor, sync::Arc};
use thiserror::Error;
use totp_rs::{Algorithm, Secret, TOTP};
use tracing::{debug, instrument};

const DIGITS: usize = 6;
const SKEW: u8 = 1;
const STEP: u64 = 30;

/// Side of the enrollment QR image, in pixels.
const QR_SIZE: u32 = 256;
/// Quiet zone around the symbol, in modules.
const QR_BORDER: i32 = 4;

#[derive(Debug, Error)]
pub enum TotpError {
    #[error(transparent)]
    Backend(#[from] IdentityError),
    #[error("invalid totp secret: {0}")]
    InvalidSecret(String),
    #[error("failed to render qrcode: {0}")]
    Qr(String),
    #[error("recovery answers do not match")]
    RecoveryMismatch,
    #[error("recovery questions must not be empty")]
    NoQuestions,
}

/// Backend-facing half of the second factor: secrets, QR enrollment, recovery.
#[derive(Clone)]
pub struct TotpEngine {
    backend: Arc<dyn IdentityBackend>,
    issuer: String,
}

impl TotpEngine {
    #[must_use]
    pub fn new(backend: Arc<dyn IdentityBackend>, issuer: String) -> Self {
        Self { backend, issuer }
    }

    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Enroll the user unless a secret already exists.
    ///
    /// Returns the base64 PNG QR code of the new secret, or an empty string if
    /// the user is already enrolled.
    ///
    /// # Errors
    /// Returns an error if the backend fails or the secret cannot be rendered.
    #[instrument(skip(self, admin))]
    pub async fn initialize(
        &self,
        admin: &BackendToken,
        user_id: &str,
        user_name: &str,
    ) -> Result<String, TotpError> {
        if self.backend.has_totp_secret(admin, user_id).await? {
            debug!("user {} already enrolled", user_id);
            return Ok(String::new());
        }
        let secret = self.backend.create_totp_secret(admin, user_id).await?;
        self.qr_code(&secret, user_name)
    }

    /// Whether `passcode` is valid for the user's secret at unix time `now`.
    ///
    /// # Errors
    /// Returns an error if the secret cannot be fetched or decoded.
    #[instrument(skip(self, admin, passcode))]
    pub async fn check(
        &self,
        admin: &BackendToken,
        user_id: &str,
        passcode: &str,
        now: u64,
    ) -> Result<bool, TotpError> {
        let secret = self.backend.totp_secret(admin, user_id).await?;
        let totp = self.totp(&secret, user_id)?;
        Ok(totp.check(passcode.trim(), now))
    }

    /// `otpauth://totp/<issuer>:<account>?secret=<base32>&issuer=<issuer>`
    ///
    /// # Errors
    /// Returns an error if the secret is not valid base32.
    pub fn otpauth_url(&self, secret: &str, account: &str) -> Result<String, TotpError> {
        Ok(self.totp(secret, account)?.get_url())
    }

    /// 256x256 PNG QR code (high error correction) of the otpauth URL, base64 encoded.
    ///
    /// # Errors
    /// Returns an error if the secret is invalid or rendering fails.
    pub fn qr_code(&self, secret: &str, account: &str) -> Result<String, TotpError> {
        let url = self.otpauth_url(secret, account)?;
        let qr = QrCode::encode_text(&url, QrCodeEcc::High)
            .map_err(|err| TotpError::Qr(err.to_string()))?;
        Ok(Base64::encode_string(&render_png(&qr)?))
    }

    /// Questions only, never the answers.
    ///
    /// # Errors
    /// Returns an error if the backend lookup fails.
    pub async fn recovery_questions(
        &self,
        admin: &BackendToken,
        user_id: &str,
    ) -> Result<Vec<String>, TotpError> {
        Ok(self
            .backend
            .recovery_questions(admin, user_id)
            .await?
            .into_iter()
            .map(|q| q.question)
            .collect())
    }

    /// # Errors
    /// Returns an error if no questions are given or the backend rejects them.
    pub async fn set_recovery_questions(
        &self,
        admin: &BackendToken,
        user_id: &str,
        questions: &[RecoveryQuestion],
    ) -> Result<(), TotpError> {
        if questions.is_empty() {
            return Err(TotpError::NoQuestions);
        }
        self.backend
            .save_recovery_questions(admin, user_id, questions)
            .await?;
        Ok(())
    }

    /// Replace the user's secret after every stored answer is matched exactly.
    /// Returns the QR code of the new secret.
    ///
    /// # Errors
    /// Returns [`TotpError::RecoveryMismatch`] on any wrong or missing answer.
    #[instrument(skip(self, admin, answers))]
    pub async fn reset_with_recovery(
        &self,
        admin: &BackendToken,
        user_id: &str,
        user_name: &str,
        answers: &[RecoveryQuestion],
    ) -> Result<String, TotpError> {
        let stored = self.backend.recovery_questions(admin, user_id).await?;
        if stored.is_empty() {
            return Err(TotpError::RecoveryMismatch);
        }

        let given: HashMap<&str, &str> = answers
            .iter()
            .map(|a| (a.question.as_str(), a.answer.as_str()))
            .collect();
        let all_match = stored
            .iter()
            .all(|q| given.get(q.question.as_str()) == Some(&q.answer.as_str()));
        if !all_match {
            return Err(TotpError::RecoveryMismatch);
        }

        self.backend.remove_totp_secret(admin, user_id).await?;
        let secret = self.backend.create_totp_secret(admin, user_id).await?;
        self.qr_code(&secret, user_name)
    }

    fn totp(&self, secret: &str, account: &str) -> Result<TOTP, TotpError> {
        let bytes = Secret::Encoded(secret.trim().to_uppercase())
            .to_bytes()
            .map_err(|err| TotpError::InvalidSecret(format!("{err:?}")))?;
        Ok(TOTP::new_unchecked(
            Algorithm::SHA1,
            DIGITS,
            SKEW,
            STEP,
            bytes,
            Some(self.issuer.clone()),
            account.to_string(),
        ))
    }
}

fn render_png(qr: &QrCode) -> Result<Vec<u8>, TotpError> {
    let modules = i64::from(qr.size() + 2 * QR_BORDER);
    // each pixel takes the colour of the module it falls in
    let module_at = |pixel: u32| {
        let module = i64::from(pixel) * modules / i64::from(QR_SIZE);
        i32::try_from(module).unwrap_or(i32::MAX) - QR_BORDER
    };
    let image = GrayImage::from_fn(QR_SIZE, QR_SIZE, |x, y| {
        if qr.get_module(module_at(x), module_at(y)) {
            Luma([0])
        } else {
            Luma([255])
        }
    });

    let mut png = Cursor::new(Vec::new());
    image
        .write_to(&mut png, ImageFormat::Png)
        .map_err(|err| TotpError::Qr(err.to_string()))?;
    Ok(png.into_inner())
}
