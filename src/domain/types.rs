use serde::{Deserialize, Serialize};

/// Lifecycle of an uploaded answer script. Transitions may only move forward
/// in declaration order; `Failed` and `Flagged` are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadStatus {
    Uploaded,
    Processing,
    OcrComplete,
    Segmented,
    Evaluating,
    Evaluated,
    Failed,
    Flagged,
}

impl UploadStatus {
    pub(crate) fn rank(self) -> u8 {
        match self {
            Self::Uploaded => 0,
            Self::Processing => 1,
            Self::OcrComplete => 2,
            Self::Segmented => 3,
            Self::Evaluating => 4,
            Self::Evaluated => 5,
            Self::Failed => 6,
            Self::Flagged => 7,
        }
    }

    pub(crate) fn is_absorbing(self) -> bool {
        matches!(self, Self::Failed | Self::Flagged)
    }

    /// Whether a transition from `self` to `next` respects the declared order.
    pub(crate) fn can_advance_to(self, next: UploadStatus) -> bool {
        !self.is_absorbing() && next.rank() > self.rank()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScriptStatus {
    Pending,
    Evaluating,
    Complete,
    Flagged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvaluationStatus {
    Pending,
    Complete,
    Overridden,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewRecommendation {
    AutoApproved,
    NeedsReview,
    MustReview,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsistencyAssessment {
    Consistent,
    MinorIssues,
    SignificantIssues,
}

/// Closed vocabulary of page-quality observations reported by OCR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QualityFlag {
    LowContrast,
    Blurry,
    PartialScan,
    Unreadable,
    LowConfidence,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudentMeta {
    pub name: String,
    #[serde(rename = "rollNo")]
    pub roll_no: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt: u64,
    pub completion: u64,
    pub total: u64,
}

impl TokenUsage {
    pub(crate) fn add(&mut self, prompt: u64, completion: u64) {
        self.prompt += prompt;
        self.completion += completion;
        self.total = self.prompt + self.completion;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_status_only_advances_forward() {
        assert!(UploadStatus::Uploaded.can_advance_to(UploadStatus::Processing));
        assert!(UploadStatus::Processing.can_advance_to(UploadStatus::Evaluated));
        assert!(UploadStatus::Evaluated.can_advance_to(UploadStatus::Flagged));
        assert!(!UploadStatus::Segmented.can_advance_to(UploadStatus::Processing));
        assert!(!UploadStatus::OcrComplete.can_advance_to(UploadStatus::OcrComplete));
    }

    #[test]
    fn terminal_statuses_absorb() {
        assert!(!UploadStatus::Failed.can_advance_to(UploadStatus::Flagged));
        assert!(!UploadStatus::Flagged.can_advance_to(UploadStatus::Evaluated));
    }

    #[test]
    fn token_usage_accumulates() {
        let mut usage = TokenUsage::default();
        usage.add(100, 40);
        usage.add(50, 10);
        assert_eq!(usage.prompt, 150);
        assert_eq!(usage.completion, 50);
        assert_eq!(usage.total, 200);
    }
}
