//! Post scheduling domain library.
//!
//! Imported task exports are normalized into canonical records, an external
//! annotation service turns them into schedule items, flags and suggestions, and
//! the pure modules here apply suggestions and drive the human review queue.

pub mod core {
    use serde::{Deserialize, Serialize};
    use serde_with::{
        DeserializeFromStr, DisplayFromStr, NoneAsEmptyString, PickFirst, SerializeDisplay,
        serde_as,
    };
    use std::{fmt, str::FromStr};

    /* ----------------------------- Imported tasks ----------------------------- */

    /// Canonical unit of imported work.
    ///
    /// Built once per import and never mutated afterwards. The tabular importer only
    /// produces a record when both `task_id` and `name` are non-blank.
    #[serde_as]
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct TaskRecord {
        pub task_id: String,
        pub name: String,

        /// Target account handle (may be empty).
        #[serde(default)]
        pub account: String,
        /// Target platform / post type (may be empty).
        #[serde(default)]
        pub post_type: String,

        #[serde(default)]
        pub status: String,
        #[serde(default)]
        pub created_at: String,
        #[serde(default)]
        pub due_date: String,

        #[serde(default)]
        pub tags: Vec<String>,

        /// Caption resolved from the notes blob, hashtags removed.
        #[serde(default)]
        pub caption: String,
        /// Primary media: the video reference, falling back to the image reference.
        #[serde(default)]
        pub media_url: String,
        #[serde_as(as = "NoneAsEmptyString")]
        #[serde(default)]
        pub thumbnail_url: Option<String>,

        #[serde(default)]
        pub assignee: String,
        #[serde(default)]
        pub assignee_email: String,
        #[serde(default)]
        pub project: String,
        #[serde(default)]
        pub section: String,
    }

    impl TaskRecord {
        pub fn new(task_id: impl Into<String>, name: impl Into<String>) -> Self {
            Self {
                task_id: task_id.into(),
                name: name.into(),
                account: String::new(),
                post_type: String::new(),
                status: String::new(),
                created_at: String::new(),
                due_date: String::new(),
                tags: vec![],
                caption: String::new(),
                media_url: String::new(),
                thumbnail_url: None,
                assignee: String::new(),
                assignee_email: String::new(),
                project: String::new(),
                section: String::new(),
            }
        }
    }

    /* ----------------------------- Schedule items ----------------------------- */

    /// Schedule item identifier. The annotation service sends either numbers or strings;
    /// change targets always compare against the string rendering.
    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(untagged)]
    pub enum ItemId {
        Number(i64),
        Text(String),
    }

    impl ItemId {
        pub fn matches(&self, key: &str) -> bool {
            match self {
                ItemId::Number(n) => n.to_string() == key,
                ItemId::Text(s) => s == key,
            }
        }
    }

    impl fmt::Display for ItemId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                ItemId::Number(n) => write!(f, "{n}"),
                ItemId::Text(s) => f.write_str(s),
            }
        }
    }

    impl From<i64> for ItemId {
        fn from(n: i64) -> Self {
            Self::Number(n)
        }
    }

    impl From<&str> for ItemId {
        fn from(s: &str) -> Self {
            Self::Text(s.to_string())
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum PostStatus {
        Draft,
        Scheduled,
        Published,
    }

    /// A post slot shown to the user. Only `FieldChange`s mutate it.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ScheduleItem {
        pub id: ItemId,
        pub title: String,
        pub platform: String,
        #[serde(alias = "scheduledDate")]
        pub date: String,
        #[serde(alias = "scheduledTime")]
        pub time: String,
        pub status: PostStatus,
        #[serde(default)]
        pub tips: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub caption: Option<String>,
        /// Opaque enhancement payload from the annotation service; display only.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub enhancement: Option<serde_json::Value>,
    }

    impl ScheduleItem {
        pub fn field(&self, field: ChangeField) -> &str {
            match field {
                ChangeField::Date => &self.date,
                ChangeField::Time => &self.time,
                ChangeField::Platform => &self.platform,
            }
        }

        /// Overwrites exactly one attribute.
        pub fn set_field(&mut self, field: ChangeField, value: &str) {
            let slot = match field {
                ChangeField::Date => &mut self.date,
                ChangeField::Time => &mut self.time,
                ChangeField::Platform => &mut self.platform,
            };
            value.clone_into(slot);
        }
    }

    /* ------------------------------ Field changes ------------------------------ */

    /// Wire form goes through `Display`/`FromStr`, so every entry path shares one rule.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, SerializeDisplay, DeserializeFromStr)]
    pub enum ChangeField {
        Date,
        Time,
        Platform,
    }

    impl ChangeField {
        pub fn as_str(self) -> &'static str {
            match self {
                ChangeField::Date => "date",
                ChangeField::Time => "time",
                ChangeField::Platform => "platform",
            }
        }
    }

    impl fmt::Display for ChangeField {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.as_str())
        }
    }

    impl FromStr for ChangeField {
        type Err = DomainError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            match s.trim().to_ascii_lowercase().as_str() {
                "date" => Ok(ChangeField::Date),
                "time" => Ok(ChangeField::Time),
                "platform" => Ok(ChangeField::Platform),
                _ => Err(DomainError::UnknownField(s.to_string())),
            }
        }
    }

    /// A single targeted overwrite. `from` is for display and never used for matching.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct FieldChange {
        #[serde(alias = "postId")]
        pub item_id: String,
        pub field: ChangeField,
        #[serde(default)]
        pub from: String,
        pub to: String,
    }

    impl FieldChange {
        pub fn new(item_id: impl Into<String>, field: ChangeField, to: impl Into<String>) -> Self {
            Self {
                item_id: item_id.into(),
                field,
                from: String::new(),
                to: to.into(),
            }
        }
    }

    /* ------------------------------- Suggestions ------------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "kebab-case")]
    pub enum SuggestionKind {
        Conflict,
        OptimalTime,
        PlatformSpecific,
        AudienceInsight,
    }

    /// Batchable recommendation; applied at most once.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Suggestion {
        pub id: String,
        #[serde(rename = "type")]
        pub kind: SuggestionKind,
        pub title: String,
        #[serde(default)]
        pub description: String,
        #[serde(default)]
        pub impact: String,
        /// Labels of the affected posts (display only).
        #[serde(default)]
        pub affected_posts: Vec<String>,
        #[serde(default)]
        pub changes: Vec<FieldChange>,
    }

    /* ------------------------------ Flagged items ------------------------------ */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "kebab-case")]
    pub enum IssueKind {
        MissingAsset,
        InvalidFormat,
        CaptionIssue,
        ScheduleConflict,
        BrokenLink,
    }

    /// Declaration order is review order: critical sorts before warning.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum Severity {
        Critical,
        Warning,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Issue {
        #[serde(rename = "type")]
        pub kind: IssueKind,
        pub severity: Severity,
        #[serde(default)]
        pub description: String,
    }

    /// What the automated pass tried and why it gave up.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct AiAttempt {
        #[serde(default)]
        pub attempted: String,
        #[serde(default)]
        pub failure_reason: String,
    }

    /// Percentage in `0..=100`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(try_from = "u8")]
    pub struct Confidence(u8);

    impl Confidence {
        pub fn value(self) -> u8 {
            self.0
        }
    }

    impl TryFrom<u8> for Confidence {
        type Error = DomainError;

        fn try_from(value: u8) -> Result<Self, Self::Error> {
            if value > 100 {
                Err(DomainError::ConfidenceOutOfRange(value))
            } else {
                Ok(Self(value))
            }
        }
    }

    impl FromStr for Confidence {
        type Err = DomainError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            let raw = s.trim().trim_end_matches('%');
            let value = raw
                .parse::<u8>()
                .map_err(|_| DomainError::InvalidConfidence(s.to_string()))?;
            Self::try_from(value)
        }
    }

    impl fmt::Display for Confidence {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    /// Fix proposed for a flagged item.
    #[serde_as]
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ProposedFix {
        pub text: String,
        #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
        pub confidence: Confidence,
        #[serde(default)]
        pub action: String,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum ResolutionAction {
        Accept,
        Edit,
        Skip,
    }

    impl fmt::Display for ResolutionAction {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(match self {
                ResolutionAction::Accept => "accept",
                ResolutionAction::Edit => "edit",
                ResolutionAction::Skip => "skip",
            })
        }
    }

    impl FromStr for ResolutionAction {
        type Err = DomainError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            match s.trim().to_ascii_lowercase().as_str() {
                "accept" => Ok(ResolutionAction::Accept),
                "edit" => Ok(ResolutionAction::Edit),
                "skip" => Ok(ResolutionAction::Skip),
                _ => Err(DomainError::UnknownAction(s.to_string())),
            }
        }
    }

    /// A unit of required human attention.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct FlaggedItem {
        pub id: String,
        pub task_title: String,
        #[serde(default)]
        pub platform: String,
        pub issue: Issue,
        #[serde(default)]
        pub ai_attempt: AiAttempt,
        pub suggestion: ProposedFix,
        /// Resolution actions the reviewer may take on this item.
        pub actions: Vec<ResolutionAction>,
    }

    impl FlaggedItem {
        pub fn permits(&self, action: ResolutionAction) -> bool {
            self.actions.contains(&action)
        }
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum DomainError {
        #[error("unknown change field {0:?} (expected date, time or platform)")]
        UnknownField(String),
        #[error("unknown resolution action {0:?} (expected accept, edit or skip)")]
        UnknownAction(String),
        #[error("confidence {0} is out of bounds (0..=100)")]
        ConfidenceOutOfRange(u8),
        #[error("confidence {0:?} is not a number")]
        InvalidConfidence(String),
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn item_ids_match_by_string_rendering() {
            assert!(ItemId::Number(42).matches("42"));
            assert!(!ItemId::Number(42).matches("042"));
            assert!(ItemId::from("post-7").matches("post-7"));
        }

        #[test]
        fn unknown_change_field_is_rejected() {
            assert_eq!("Time".parse::<ChangeField>(), Ok(ChangeField::Time));
            assert_eq!(
                "caption".parse::<ChangeField>(),
                Err(DomainError::UnknownField("caption".into()))
            );

            let raw = r#"{"itemId":"1","field":"caption","from":"","to":"x"}"#;
            assert!(serde_json::from_str::<FieldChange>(raw).is_err());
        }

        #[test]
        fn change_field_reads_the_same_from_text_and_json() {
            let change: FieldChange =
                serde_json::from_str(r#"{"postId":"1","field":" Time ","to":"14:00"}"#)
                    .expect("field change");
            assert_eq!(change.field, " Time ".parse::<ChangeField>().expect("parse"));
            assert_eq!(change.field, ChangeField::Time);
            assert_eq!(
                serde_json::to_value(change.field).expect("serialize"),
                serde_json::json!("time")
            );
        }

        #[test]
        fn set_field_overwrites_one_attribute() {
            let mut item: ScheduleItem = serde_json::from_str(
                r#"{"id":1,"title":"Launch","platform":"instagram","scheduledDate":"2025-11-25","scheduledTime":"10:00","status":"draft"}"#,
            )
            .expect("schedule item");
            item.set_field(ChangeField::Time, "14:00");
            assert_eq!(item.time, "14:00");
            assert_eq!(item.date, "2025-11-25");
            assert_eq!(item.field(ChangeField::Platform), "instagram");
        }

        #[test]
        fn confidence_accepts_numbers_and_numeric_strings() {
            let fix: ProposedFix =
                serde_json::from_str(r#"{"text":"Use the image","confidence":"85","action":"swap"}"#)
                    .expect("string confidence");
            assert_eq!(fix.confidence.value(), 85);

            let fix: ProposedFix =
                serde_json::from_str(r#"{"text":"Use the image","confidence":92}"#)
                    .expect("numeric confidence");
            assert_eq!(fix.confidence.value(), 92);

            assert!(
                serde_json::from_str::<ProposedFix>(r#"{"text":"x","confidence":101}"#).is_err()
            );
        }

        #[test]
        fn blank_thumbnail_reads_as_none() {
            let record: TaskRecord = serde_json::from_str(
                r#"{"taskId":"1","name":"Demo Post","thumbnailUrl":""}"#,
            )
            .expect("task record");
            assert_eq!(record.thumbnail_url, None);
            assert!(record.tags.is_empty());
        }

        #[test]
        fn severity_orders_critical_first() {
            assert!(Severity::Critical < Severity::Warning);
        }
    }
}

pub mod extract {
    //! Structured hints embedded in a task's free-text notes.
    //!
    //! Recognized lines look like `Video: https://...`, matched case-insensitively
    //! at the start of a line. A missing label is an empty slot, never an error.

    use nom::{
        IResult,
        bytes::complete::take_while1,
        character::complete::{char, space0},
        error::VerboseError,
        sequence::{pair, terminated},
    };
    use serde::{Deserialize, Serialize};

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum NoteLabel {
        Video,
        Thumbnail,
        Image,
        Caption,
    }

    impl NoteLabel {
        pub const ALL: [NoteLabel; 4] = [
            NoteLabel::Video,
            NoteLabel::Thumbnail,
            NoteLabel::Image,
            NoteLabel::Caption,
        ];

        pub fn as_str(self) -> &'static str {
            match self {
                NoteLabel::Video => "video",
                NoteLabel::Thumbnail => "thumbnail",
                NoteLabel::Image => "image",
                NoteLabel::Caption => "caption",
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ExtractedNotes {
        pub video_url: Option<String>,
        pub thumbnail_url: Option<String>,
        pub image_url: Option<String>,
        /// Caption body with hashtags stripped.
        pub caption: Option<String>,
        /// Hashtags removed from the caption, without the leading `#`.
        #[serde(default)]
        pub hashtags: Vec<String>,
    }

    impl ExtractedNotes {
        /// Video reference, falling back to the image reference.
        pub fn primary_media(&self) -> Option<&str> {
            self.video_url.as_deref().or(self.image_url.as_deref())
        }

        pub fn is_empty(&self) -> bool {
            self.video_url.is_none()
                && self.thumbnail_url.is_none()
                && self.image_url.is_none()
                && self.caption.is_none()
        }
    }

    /// Extract the labeled slots from a notes blob. The first occurrence of a label wins.
    pub fn extract_notes(notes: &str) -> ExtractedNotes {
        let mut out = ExtractedNotes::default();
        for line in notes.lines() {
            let Some((label, value)) = labeled_line(line) else {
                continue;
            };
            match label {
                NoteLabel::Video => set_once(&mut out.video_url, value),
                NoteLabel::Thumbnail => set_once(&mut out.thumbnail_url, value),
                NoteLabel::Image => set_once(&mut out.image_url, value),
                NoteLabel::Caption if out.caption.is_none() => {
                    let (body, tags) = strip_hashtags(value);
                    out.hashtags.extend(tags);
                    if !body.is_empty() {
                        out.caption = Some(body);
                    }
                }
                NoteLabel::Caption => {}
            }
        }
        out
    }

    /// Remove every `#word` token. Returns the remaining text, trimmed, and the removed
    /// tags. Only the gap a tag leaves behind is closed; other spacing and line breaks
    /// are kept as written.
    pub fn strip_hashtags(text: &str) -> (String, Vec<String>) {
        let mut body = String::with_capacity(text.len());
        let mut tags = Vec::new();
        let mut chars = text.chars().peekable();
        while let Some(c) = chars.next() {
            if !(c == '#' && chars.peek().is_some_and(|n| is_word_char(*n))) {
                body.push(c);
                continue;
            }
            let mut tag = String::new();
            while let Some(&n) = chars.peek() {
                if !is_word_char(n) {
                    break;
                }
                tag.push(n);
                chars.next();
            }
            tags.push(tag);

            match chars.peek() {
                // tag ended its line: drop the space that preceded it
                None | Some('\n' | '\r') => {
                    let kept = body.trim_end_matches(is_blank).len();
                    body.truncate(kept);
                }
                // tag sat between words: keep one separator
                Some(_) if body.is_empty() || body.ends_with(char::is_whitespace) => {
                    while chars.next_if(|n| is_blank(*n)).is_some() {}
                }
                Some(_) => {}
            }
        }
        (body.trim().to_string(), tags)
    }

    fn is_blank(c: char) -> bool {
        c == ' ' || c == '\t'
    }

    fn set_once(slot: &mut Option<String>, value: &str) {
        if slot.is_none() {
            *slot = Some(value.to_string());
        }
    }

    fn is_word_char(c: char) -> bool {
        c.is_alphanumeric() || c == '_'
    }

    fn label_prefix(i: &str) -> PResult<'_, &str> {
        terminated(
            take_while1(|c: char| c.is_ascii_alphabetic()),
            pair(space0, char(':')),
        )(i)
    }

    fn labeled_line(line: &str) -> Option<(NoteLabel, &str)> {
        let (value, head) = label_prefix(line.trim_start()).ok()?;
        let label = NoteLabel::ALL
            .into_iter()
            .find(|l| head.eq_ignore_ascii_case(l.as_str()))?;
        let value = value.trim();
        (!value.is_empty()).then_some((label, value))
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use pretty_assertions::assert_eq;
        use rstest::rstest;

        #[test]
        fn video_and_caption_with_hashtag() {
            let notes = extract_notes("Video: https://x/a.mp4\nCaption: Hello #world");
            assert_eq!(notes.video_url.as_deref(), Some("https://x/a.mp4"));
            assert_eq!(notes.caption.as_deref(), Some("Hello"));
            assert_eq!(notes.hashtags, vec!["world".to_string()]);
            assert_eq!(notes.primary_media(), Some("https://x/a.mp4"));
        }

        #[test]
        fn labels_are_case_insensitive_and_trimmed() {
            let notes = extract_notes(
                "  THUMBNAIL:   https://x/t.jpg  \r\nimage : https://x/i.png\nunrelated line",
            );
            assert_eq!(notes.thumbnail_url.as_deref(), Some("https://x/t.jpg"));
            assert_eq!(notes.image_url.as_deref(), Some("https://x/i.png"));
            assert_eq!(notes.video_url, None);
            assert_eq!(notes.primary_media(), Some("https://x/i.png"));
        }

        #[test]
        fn missing_labels_yield_empty_result() {
            let notes = extract_notes("Just some planning notes.\nNothing structured here.");
            assert!(notes.is_empty());
            assert_eq!(notes, ExtractedNotes::default());
        }

        #[test]
        fn label_must_start_the_line() {
            let notes = extract_notes("See Video: https://x/a.mp4");
            assert_eq!(notes.video_url, None);
        }

        #[test]
        fn first_occurrence_wins() {
            let notes = extract_notes("Video: https://x/1.mp4\nVideo: https://x/2.mp4");
            assert_eq!(notes.video_url.as_deref(), Some("https://x/1.mp4"));
        }

        #[test]
        fn empty_value_is_absent() {
            let notes = extract_notes("Caption:\nImage:   ");
            assert!(notes.is_empty());
        }

        #[rstest]
        #[case("Hello #world", "Hello", &["world"])]
        #[case("#launch Big news today #2025 #new_drop", "Big news today", &["launch", "2025", "new_drop"])]
        #[case("Price is # not a tag", "Price is # not a tag", &[])]
        #[case("Sale!#deals ends soon", "Sale! ends soon", &["deals"])]
        #[case("Hello  world", "Hello  world", &[])]
        #[case("Big #news  today", "Big today", &["news"])]
        #[case("Line one #a\nLine  two #b #c\nEnd", "Line one\nLine  two\nEnd", &["a", "b", "c"])]
        fn hashtags_are_stripped(#[case] input: &str, #[case] body: &str, #[case] tags: &[&str]) {
            let (got, got_tags) = strip_hashtags(input);
            assert_eq!(got, body);
            assert_eq!(got_tags, tags.iter().map(|t| t.to_string()).collect::<Vec<_>>());
        }
    }
}

pub mod import {
    //! Import normalization: raw CSV exports or JSON task lists into `TaskRecord`s.
    //!
    //! Tabular strategy:
    //! - Skip the reserved leading lines (title + blank) of the export.
    //! - Read RFC-4180 style records with `nom`; quoted cells may span lines.
    //! - The first record is the header; each following row must carry a task id and
    //!   a name or it is dropped without error.
    //! - The notes cell is handed to `extract::extract_notes`.

    use crate::config::ImportConfig;
    use crate::core::TaskRecord;
    use crate::extract::extract_notes;
    use chrono::{Local, NaiveDate};
    use indexmap::IndexMap;
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{tag, take_while},
        character::complete::{char, line_ending},
        combinator::{cut, eof, map, peek},
        error::{VerboseError, VerboseErrorKind, context},
        multi::separated_list1,
    };
    use serde::{Deserialize, Serialize};
    use serde_json::Value;
    use std::{
        collections::HashSet,
        fs,
        path::{Path, PathBuf},
    };
    use tracing::{debug, info, warn};

    /// Header names as exported by the project tool (case-sensitive).
    pub mod column {
        pub const TASK_ID: &str = "Task ID";
        pub const NAME: &str = "Name";
        pub const ACCOUNT: &str = "Account";
        pub const POST_TYPE: &str = "Post Type";
        pub const STATUS: &str = "Status";
        pub const CREATED_AT: &str = "Created At";
        pub const DUE_DATE: &str = "Due Date";
        pub const TAGS: &str = "Tags";
        pub const NOTES: &str = "Notes";
        pub const ASSIGNEE: &str = "Assignee";
        pub const ASSIGNEE_EMAIL: &str = "Assignee Email";
        pub const PROJECTS: &str = "Projects";
        pub const SECTION: &str = "Section/Column";
    }

    /* -------------------------------- Errors -------------------------------- */

    #[derive(Debug, thiserror::Error)]
    pub enum ImportError {
        #[error("malformed CSV at line {line}: {message}")]
        Malformed { line: usize, message: String },
        #[error("CSV has no header row after skipping {skipped} reserved line(s)")]
        MissingHeader { skipped: usize },
        #[error("CSV header is missing the required {0:?} column")]
        MissingColumn(&'static str),
        #[error("no valid rows found: every row is missing a task id or a name")]
        NoValidRows,
        #[error("invalid JSON: {0}")]
        Json(#[from] serde_json::Error),
        #[error(
            "unexpected JSON shape: expected an array of tasks or an object with a `tasks` array, found {0}"
        )]
        UnexpectedShape(String),
        #[error("unsupported file type {extension:?} (accepted: {allowed})")]
        UnsupportedFormat { extension: String, allowed: String },
        #[error("file is {size} bytes, above the {limit} byte limit")]
        FileTooLarge { size: u64, limit: u64 },
        #[error("input is not valid UTF-8: {0}")]
        Encoding(#[from] std::str::Utf8Error),
        #[error("reading {path:?}: {source}")]
        Io {
            path: PathBuf,
            #[source]
            source: std::io::Error,
        },
    }

    /* ------------------------------ Input format ------------------------------ */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum ImportFormat {
        Csv,
        Json,
    }

    impl ImportFormat {
        /// Detect the format from the file extension, limited to `allowed` extensions.
        pub fn from_path(path: &Path, allowed: &[String]) -> Result<Self, ImportError> {
            let extension = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_ascii_lowercase())
                .unwrap_or_default();
            let permitted = allowed
                .iter()
                .any(|a| a.trim_start_matches('.').eq_ignore_ascii_case(&extension));
            let format = match extension.as_str() {
                "csv" => Some(ImportFormat::Csv),
                "json" => Some(ImportFormat::Json),
                _ => None,
            };
            match format {
                Some(format) if permitted => Ok(format),
                _ => Err(ImportError::UnsupportedFormat {
                    extension,
                    allowed: allowed.join(", "),
                }),
            }
        }
    }

    /* ------------------------------- Normalizer ------------------------------- */

    /// Row accounting for a tabular import.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
    pub struct NormalizeReport {
        pub rows_read: usize,
        pub accepted: usize,
        pub dropped: usize,
    }

    /// Converts raw import input into canonical records.
    ///
    /// `today` fills absent created/due dates; it is fixed at construction so repeated
    /// normalization of the same input is deterministic.
    #[derive(Debug, Clone)]
    pub struct Normalizer {
        config: ImportConfig,
        today: NaiveDate,
    }

    impl Normalizer {
        pub fn new(config: ImportConfig) -> Self {
            Self::with_today(config, Local::now().date_naive())
        }

        pub fn with_today(config: ImportConfig, today: NaiveDate) -> Self {
            Self { config, today }
        }

        pub fn config(&self) -> &ImportConfig {
            &self.config
        }

        /// Read, size-check and normalize a `.csv` or `.json` file.
        pub fn read_file(&self, path: &Path) -> Result<Vec<TaskRecord>, ImportError> {
            let format = ImportFormat::from_path(path, &self.config.allowed_extensions)?;
            let io_err = |source| ImportError::Io {
                path: path.to_path_buf(),
                source,
            };
            let size = fs::metadata(path).map_err(io_err)?.len();
            if size > self.config.max_file_bytes {
                return Err(ImportError::FileTooLarge {
                    size,
                    limit: self.config.max_file_bytes,
                });
            }
            let bytes = fs::read(path).map_err(io_err)?;
            debug!(?path, ?format, size, "read import file");
            self.normalize(format, &bytes)
        }

        pub fn normalize(
            &self,
            format: ImportFormat,
            bytes: &[u8],
        ) -> Result<Vec<TaskRecord>, ImportError> {
            let text = std::str::from_utf8(bytes)?;
            match format {
                ImportFormat::Csv => self.normalize_csv(text),
                ImportFormat::Json => self.normalize_json(text),
            }
        }

        pub fn normalize_csv(&self, input: &str) -> Result<Vec<TaskRecord>, ImportError> {
            self.normalize_csv_with_report(input)
                .map(|(records, _)| records)
        }

        pub fn normalize_csv_with_report(
            &self,
            input: &str,
        ) -> Result<(Vec<TaskRecord>, NormalizeReport), ImportError> {
            let input = strip_bom(input);
            let (body, skipped) = skip_lines(input, self.config.skip_leading_rows);
            let mut rows = read_csv_rows(body, skipped + 1)?.into_iter();
            let header = rows.next().ok_or(ImportError::MissingHeader { skipped })?;
            let columns = ColumnMap::from_header(&header.cells)?;

            let mut report = NormalizeReport::default();
            let mut seen = HashSet::new();
            let mut records = Vec::new();
            for row in rows {
                report.rows_read += 1;
                let Some(record) = self.row_to_record(&columns, &row) else {
                    debug!(line = row.line, "dropping row without task id or name");
                    report.dropped += 1;
                    continue;
                };
                if !seen.insert(record.task_id.clone()) {
                    warn!(line = row.line, task_id = %record.task_id, "duplicate task id in import");
                }
                records.push(record);
            }
            report.accepted = records.len();

            if records.is_empty() {
                return Err(ImportError::NoValidRows);
            }
            info!(
                accepted = report.accepted,
                dropped = report.dropped,
                "normalized tabular import"
            );
            Ok((records, report))
        }

        /// Accepts `[task, ...]` or `{ "tasks": [task, ...] }`. Records are taken as
        /// already canonical: no filtering and no notes extraction.
        pub fn normalize_json(&self, input: &str) -> Result<Vec<TaskRecord>, ImportError> {
            let value: Value = serde_json::from_str(strip_bom(input))?;
            let tasks = match value {
                Value::Array(items) => items,
                Value::Object(mut map) => match map.remove("tasks") {
                    Some(Value::Array(items)) => items,
                    Some(other) => {
                        return Err(ImportError::UnexpectedShape(format!(
                            "`tasks` holding {}",
                            json_kind(&other)
                        )));
                    }
                    None => {
                        return Err(ImportError::UnexpectedShape(
                            "an object without a `tasks` key".to_string(),
                        ));
                    }
                },
                other => return Err(ImportError::UnexpectedShape(json_kind(&other).to_string())),
            };
            let records = tasks
                .into_iter()
                .map(serde_json::from_value)
                .collect::<Result<Vec<TaskRecord>, _>>()?;
            info!(accepted = records.len(), "normalized structured import");
            Ok(records)
        }

        fn row_to_record(&self, columns: &ColumnMap, row: &CsvRow) -> Option<TaskRecord> {
            let task_id = columns.get(row, column::TASK_ID);
            let name = columns.get(row, column::NAME);
            if task_id.is_empty() || name.is_empty() {
                return None;
            }

            let today = self.today.format("%Y-%m-%d").to_string();
            let notes = extract_notes(columns.raw(row, column::NOTES));

            Some(TaskRecord {
                task_id: task_id.to_string(),
                name: name.to_string(),
                account: columns.get(row, column::ACCOUNT).to_string(),
                post_type: columns.get(row, column::POST_TYPE).to_string(),
                status: or_default(columns.get(row, column::STATUS), &self.config.default_status),
                created_at: or_default(columns.get(row, column::CREATED_AT), &today),
                due_date: or_default(columns.get(row, column::DUE_DATE), &today),
                tags: split_tags(columns.get(row, column::TAGS)),
                caption: notes.caption.clone().unwrap_or_default(),
                media_url: notes.primary_media().unwrap_or_default().to_string(),
                thumbnail_url: notes.thumbnail_url.clone(),
                assignee: columns.get(row, column::ASSIGNEE).to_string(),
                assignee_email: columns.get(row, column::ASSIGNEE_EMAIL).to_string(),
                project: columns.get(row, column::PROJECTS).to_string(),
                section: columns.get(row, column::SECTION).to_string(),
            })
        }
    }

    struct ColumnMap {
        index: IndexMap<String, usize>,
    }

    impl ColumnMap {
        fn from_header(cells: &[String]) -> Result<Self, ImportError> {
            let mut index = IndexMap::new();
            for (i, name) in cells.iter().enumerate() {
                index.entry(name.trim().to_string()).or_insert(i);
            }
            for required in [column::TASK_ID, column::NAME] {
                if !index.contains_key(required) {
                    return Err(ImportError::MissingColumn(required));
                }
            }
            Ok(Self { index })
        }

        fn raw<'r>(&self, row: &'r CsvRow, name: &str) -> &'r str {
            self.index
                .get(name)
                .and_then(|&i| row.cells.get(i))
                .map(String::as_str)
                .unwrap_or_default()
        }

        fn get<'r>(&self, row: &'r CsvRow, name: &str) -> &'r str {
            self.raw(row, name).trim()
        }
    }

    fn or_default(value: &str, default: &str) -> String {
        if value.is_empty() {
            default.to_string()
        } else {
            value.to_string()
        }
    }

    fn split_tags(raw: &str) -> Vec<String> {
        raw.split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect()
    }

    fn strip_bom(input: &str) -> &str {
        input.strip_prefix('\u{feff}').unwrap_or(input)
    }

    /// Skip up to `n` physical lines; returns the remainder and how many were skipped.
    fn skip_lines(input: &str, n: usize) -> (&str, usize) {
        let mut rest = input;
        for skipped in 0..n {
            match rest.find('\n') {
                Some(idx) => rest = &rest[idx + 1..],
                None => return ("", skipped + usize::from(!rest.is_empty())),
            }
        }
        (rest, n)
    }

    fn json_kind(value: &Value) -> &'static str {
        match value {
            Value::Null => "null",
            Value::Bool(_) => "a boolean",
            Value::Number(_) => "a number",
            Value::String(_) => "a string",
            Value::Array(_) => "an array",
            Value::Object(_) => "an object",
        }
    }

    /* ------------------------------ CSV reader ------------------------------ */

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /// One non-blank record. `line` is the physical line the record starts on.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct CsvRow {
        pub line: usize,
        pub cells: Vec<String>,
    }

    /// Read all records of `input`; `first_line` is the line number of its first byte.
    pub fn read_csv_rows(input: &str, first_line: usize) -> Result<Vec<CsvRow>, ImportError> {
        let mut rows = Vec::new();
        let mut rest = input;
        let mut line = first_line;
        while !rest.is_empty() {
            let (after, cells) =
                csv_record(rest).map_err(|e| malformed(input, first_line, e))?;
            if cells.iter().any(|c| !c.trim().is_empty()) {
                rows.push(CsvRow { line, cells });
            }
            // count only what this step consumed; quoted cells may span lines
            line += newlines_consumed(rest, after);
            if after.is_empty() {
                break;
            }
            let (next, _) = end_of_record(after).map_err(|e| malformed(input, first_line, e))?;
            line += newlines_consumed(after, next);
            rest = next;
        }
        Ok(rows)
    }

    fn newlines_consumed(before: &str, after: &str) -> usize {
        line_of(before, before.len() - after.len())
    }

    fn line_of(input: &str, offset: usize) -> usize {
        input[..offset].matches('\n').count()
    }

    fn malformed<'a>(
        input: &'a str,
        first_line: usize,
        err: nom::Err<VerboseError<&'a str>>,
    ) -> ImportError {
        let ve = match err {
            nom::Err::Error(ve) | nom::Err::Failure(ve) => ve,
            nom::Err::Incomplete(_) => {
                return ImportError::Malformed {
                    line: first_line,
                    message: "incomplete input".to_string(),
                };
            }
        };
        let (frag, message) = ve
            .errors
            .iter()
            .find_map(|(frag, kind)| match kind {
                VerboseErrorKind::Context(ctx) => Some((*frag, (*ctx).to_string())),
                _ => None,
            })
            .or_else(|| {
                ve.errors
                    .first()
                    .map(|(frag, kind)| (*frag, format!("{:?}", kind)))
            })
            .unwrap_or((input, "unrecognized structure".to_string()));
        let offset = input.len().saturating_sub(frag.len());
        let near = frag.lines().next().unwrap_or_default();
        ImportError::Malformed {
            line: first_line + line_of(input, offset),
            message: format!("{message} near {near:?}"),
        }
    }

    fn csv_record(i: &str) -> PResult<'_, Vec<String>> {
        separated_list1(char(','), csv_field)(i)
    }

    fn csv_field(i: &str) -> PResult<'_, String> {
        alt((quoted_field, bare_field))(i)
    }

    fn bare_field(i: &str) -> PResult<'_, String> {
        map(
            take_while(|c: char| c != ',' && c != '\n' && c != '\r'),
            str::to_string,
        )(i)
    }

    fn quoted_field(start: &str) -> PResult<'_, String> {
        let (mut i, _) = char::<&str, VerboseError<&str>>('"')(start)?;
        let mut out = String::new();
        loop {
            let Some(idx) = i.find('"') else {
                return Err(nom::Err::Failure(VerboseError {
                    errors: vec![(start, VerboseErrorKind::Context("unterminated quoted field"))],
                }));
            };
            out.push_str(&i[..idx]);
            let after = &i[idx + 1..];
            if let Some(next) = after.strip_prefix('"') {
                out.push('"');
                i = next;
                continue;
            }
            return cut(context(
                "unexpected character after closing quote",
                peek(alt((eof, tag(","), line_ending))),
            ))(after)
            .map(|(rest, _)| (rest, out));
        }
    }

    fn end_of_record(i: &str) -> PResult<'_, &str> {
        context("expected end of line", line_ending)(i)
    }

}

pub mod schedule {
    //! Pure operations over a schedule item collection: targeted field overwrites,
    //! suggestion application and time-slot conflict detection.
    //!
    //! Every operation takes the current collection by reference and returns a new one.

    use crate::core::*;
    use crate::selection::SelectionSet;
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};
    use tracing::{debug, info};

    /* ----------------------------- Field changes ----------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
    pub struct ApplyReport {
        /// Changes that found their target.
        pub applied: usize,
        /// Target ids that matched no item, in change order.
        pub missed: Vec<String>,
    }

    /// Apply `changes` in order. Later changes to the same item and field win; changes
    /// whose target is missing are skipped.
    pub fn apply_changes(items: &[ScheduleItem], changes: &[FieldChange]) -> Vec<ScheduleItem> {
        apply_changes_with_report(items, changes).0
    }

    pub fn apply_changes_with_report(
        items: &[ScheduleItem],
        changes: &[FieldChange],
    ) -> (Vec<ScheduleItem>, ApplyReport) {
        let mut out = items.to_vec();
        let mut report = ApplyReport::default();
        for change in changes {
            match out.iter_mut().find(|item| item.id.matches(&change.item_id)) {
                Some(item) => {
                    item.set_field(change.field, &change.to);
                    report.applied += 1;
                }
                None => {
                    debug!(item_id = %change.item_id, field = %change.field, "change target not found");
                    report.missed.push(change.item_id.clone());
                }
            }
        }
        (out, report)
    }

    pub fn apply_suggestion(items: &[ScheduleItem], suggestion: &Suggestion) -> Vec<ScheduleItem> {
        apply_changes(items, &suggestion.changes)
    }

    /// Apply the concatenated change lists of `batch`, in batch order.
    pub fn apply_suggestions<'a>(
        items: &[ScheduleItem],
        batch: impl IntoIterator<Item = &'a Suggestion>,
    ) -> Vec<ScheduleItem> {
        apply_changes(items, &collect_changes(batch))
    }

    fn collect_changes<'a>(batch: impl IntoIterator<Item = &'a Suggestion>) -> Vec<FieldChange> {
        batch
            .into_iter()
            .flat_map(|s| s.changes.iter().cloned())
            .collect()
    }

    /* -------------------------------- Conflicts -------------------------------- */

    /// Two or more items sharing an exact date/time pair.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ConflictGroup {
        pub date: String,
        pub time: String,
        pub item_ids: Vec<ItemId>,
    }

    /// Groups are returned in order of first appearance. Advisory only.
    pub fn detect_conflicts(items: &[ScheduleItem]) -> Vec<ConflictGroup> {
        let mut slots: IndexMap<(&str, &str), Vec<&ItemId>> = IndexMap::new();
        for item in items {
            slots
                .entry((item.date.as_str(), item.time.as_str()))
                .or_default()
                .push(&item.id);
        }
        slots
            .into_iter()
            .filter(|(_, ids)| ids.len() > 1)
            .map(|((date, time), ids)| ConflictGroup {
                date: date.to_string(),
                time: time.to_string(),
                item_ids: ids.into_iter().cloned().collect(),
            })
            .collect()
    }

    /* ---------------------------- Suggestion board ---------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum MutationError {
        #[error("suggestion {0:?} is not active (unknown or already applied)")]
        SuggestionNotActive(String),
    }

    /// Active and applied suggestions. A suggestion moves to `applied` exactly once.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct SuggestionBoard {
        active: Vec<Suggestion>,
        applied: Vec<Suggestion>,
    }

    /// Result of applying suggestions: the new collection and the new board.
    #[derive(Debug, Clone, PartialEq)]
    pub struct Applied {
        pub items: Vec<ScheduleItem>,
        pub board: SuggestionBoard,
        pub applied_ids: Vec<String>,
        pub report: ApplyReport,
    }

    impl SuggestionBoard {
        pub fn new(suggestions: Vec<Suggestion>) -> Self {
            Self {
                active: suggestions,
                applied: vec![],
            }
        }

        pub fn active(&self) -> &[Suggestion] {
            &self.active
        }

        pub fn applied(&self) -> &[Suggestion] {
            &self.applied
        }

        pub fn is_active(&self, id: &str) -> bool {
            self.active.iter().any(|s| s.id == id)
        }

        pub fn apply_one(&self, items: &[ScheduleItem], id: &str) -> Result<Applied, MutationError> {
            if !self.is_active(id) {
                return Err(MutationError::SuggestionNotActive(id.to_string()));
            }
            Ok(self.apply_where(items, |s| s.id == id))
        }

        /// Apply the selected suggestions that are still active.
        pub fn apply_selected(&self, items: &[ScheduleItem], selection: &SelectionSet) -> Applied {
            self.apply_where(items, |s| selection.is_selected(&s.id, &self.active))
        }

        pub fn apply_all(&self, items: &[ScheduleItem]) -> Applied {
            self.apply_where(items, |_| true)
        }

        fn apply_where(
            &self,
            items: &[ScheduleItem],
            pick: impl Fn(&Suggestion) -> bool,
        ) -> Applied {
            let (batch, remaining): (Vec<Suggestion>, Vec<Suggestion>) =
                self.active.iter().cloned().partition(|s| pick(s));
            let (items, report) = apply_changes_with_report(items, &collect_changes(&batch));
            let applied_ids: Vec<String> = batch.iter().map(|s| s.id.clone()).collect();
            if !applied_ids.is_empty() {
                info!(
                    suggestions = applied_ids.len(),
                    changes = report.applied,
                    missed = report.missed.len(),
                    "applied suggestions"
                );
            }
            let mut applied = self.applied.clone();
            applied.extend(batch);
            Applied {
                items,
                board: SuggestionBoard {
                    active: remaining,
                    applied,
                },
                applied_ids,
                report,
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use pretty_assertions::assert_eq;

        fn item(id: i64, date: &str, time: &str) -> ScheduleItem {
            ScheduleItem {
                id: ItemId::Number(id),
                title: format!("Post {id}"),
                platform: "instagram".into(),
                date: date.into(),
                time: time.into(),
                status: PostStatus::Draft,
                tips: vec![],
                caption: None,
                enhancement: None,
            }
        }

        fn suggestion(id: &str, changes: Vec<FieldChange>) -> Suggestion {
            Suggestion {
                id: id.into(),
                kind: SuggestionKind::OptimalTime,
                title: format!("Suggestion {id}"),
                description: String::new(),
                impact: String::new(),
                affected_posts: vec![],
                changes,
            }
        }

        #[test]
        fn each_field_overwrites_its_attribute() {
            let items = vec![item(1, "2025-11-25", "10:00")];
            let out = apply_changes(
                &items,
                &[
                    FieldChange::new("1", ChangeField::Date, "2025-11-26"),
                    FieldChange::new("1", ChangeField::Time, "18:30"),
                    FieldChange::new("1", ChangeField::Platform, "tiktok"),
                ],
            );
            assert_eq!(out[0].date, "2025-11-26");
            assert_eq!(out[0].time, "18:30");
            assert_eq!(out[0].platform, "tiktok");
            assert_eq!(items[0].time, "10:00");
        }

        #[test]
        fn last_write_wins() {
            let items = vec![item(1, "2025-11-25", "10:00")];
            let s = suggestion(
                "s1",
                vec![
                    FieldChange::new("1", ChangeField::Time, "09:00"),
                    FieldChange::new("1", ChangeField::Time, "11:00"),
                ],
            );
            let out = apply_suggestion(&items, &s);
            assert_eq!(out[0].time, "11:00");
        }

        #[test]
        fn batch_applies_in_suggestion_order() {
            let items = vec![item(1, "2025-11-25", "10:00")];
            let first = suggestion("a", vec![FieldChange::new("1", ChangeField::Time, "09:00")]);
            let second = suggestion("b", vec![FieldChange::new("1", ChangeField::Time, "17:00")]);
            assert_eq!(apply_suggestions(&items, [&first, &second])[0].time, "17:00");
            assert_eq!(apply_suggestions(&items, [&second, &first])[0].time, "09:00");
        }

        #[test]
        fn missing_target_is_a_noop() {
            let items = vec![item(1, "2025-11-25", "10:00")];
            let (out, report) = apply_changes_with_report(
                &items,
                &[FieldChange::new("99", ChangeField::Time, "12:00")],
            );
            assert_eq!(out, items);
            assert_eq!(report.missed, vec!["99".to_string()]);
            assert_eq!(report.applied, 0);
        }

        #[test]
        fn applying_twice_equals_applying_once() {
            let items = vec![
                item(1, "2025-11-25", "10:00"),
                item(2, "2025-11-25", "10:00"),
            ];
            let changes = vec![
                FieldChange::new("2", ChangeField::Time, "14:00"),
                FieldChange::new("1", ChangeField::Platform, "linkedin"),
                FieldChange::new("2", ChangeField::Time, "15:00"),
            ];
            let once = apply_changes(&items, &changes);
            let twice = apply_changes(&once, &changes);
            assert_eq!(once, twice);
        }

        #[test]
        fn conflicts_clear_after_retiming() {
            let items = vec![
                item(1, "2025-11-25", "10:00"),
                item(2, "2025-11-25", "10:00"),
                item(3, "2025-11-26", "10:00"),
            ];
            let conflicts = detect_conflicts(&items);
            assert_eq!(
                conflicts,
                vec![ConflictGroup {
                    date: "2025-11-25".into(),
                    time: "10:00".into(),
                    item_ids: vec![ItemId::Number(1), ItemId::Number(2)],
                }]
            );

            let moved = apply_changes(&items, &[FieldChange::new("2", ChangeField::Time, "14:00")]);
            assert!(detect_conflicts(&moved).is_empty());
        }

        #[test]
        fn conflicts_require_exact_match() {
            let items = vec![item(1, "2025-11-25", "10:00"), item(2, "2025-11-25", "10:00 ")];
            assert!(detect_conflicts(&items).is_empty());
        }

        #[test]
        fn board_applies_each_suggestion_once() {
            let items = vec![item(1, "2025-11-25", "10:00"), item(2, "2025-11-25", "10:00")];
            let board = SuggestionBoard::new(vec![
                suggestion("a", vec![FieldChange::new("2", ChangeField::Time, "14:00")]),
                suggestion("b", vec![FieldChange::new("1", ChangeField::Platform, "x")]),
            ]);

            let first = board.apply_one(&items, "a").expect("apply a");
            assert_eq!(first.items[1].time, "14:00");
            assert_eq!(first.applied_ids, vec!["a".to_string()]);
            assert!(!first.board.is_active("a"));
            assert_eq!(first.board.applied().len(), 1);

            assert_eq!(
                first.board.apply_one(&first.items, "a").unwrap_err(),
                MutationError::SuggestionNotActive("a".into())
            );

            let all = first.board.apply_all(&first.items);
            assert_eq!(all.applied_ids, vec!["b".to_string()]);
            assert!(all.board.active().is_empty());

            let again = all.board.apply_all(&all.items);
            assert!(again.applied_ids.is_empty());
            assert_eq!(again.items, all.items);
            assert_eq!(again.board, all.board);
        }

        #[test]
        fn board_applies_only_selected() {
            let items = vec![item(1, "2025-11-25", "10:00")];
            let board = SuggestionBoard::new(vec![
                suggestion("a", vec![FieldChange::new("1", ChangeField::Time, "08:00")]),
                suggestion("b", vec![FieldChange::new("1", ChangeField::Date, "2025-12-01")]),
            ]);
            let selection = SelectionSet::new().toggled("b", board.active());
            let out = board.apply_selected(&items, &selection);
            assert_eq!(out.applied_ids, vec!["b".to_string()]);
            assert_eq!(out.items[0].date, "2025-12-01");
            assert_eq!(out.items[0].time, "10:00");
            assert!(!selection.has_any(out.board.active()));
        }
    }
}

pub mod selection {
    //! Which active suggestions are marked for batch application.

    use crate::core::Suggestion;
    use serde::{Deserialize, Serialize};
    use std::collections::BTreeSet;

    /// Selected suggestion ids. Every query intersects with the active list it is given,
    /// so ids that were applied since never count as selected.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct SelectionSet {
        selected: BTreeSet<String>,
    }

    impl SelectionSet {
        pub fn new() -> Self {
            Self::default()
        }

        /// Flip one id. Ids that are not active are ignored.
        #[must_use]
        pub fn toggled(&self, id: &str, active: &[Suggestion]) -> Self {
            let mut next = self.reconciled(active);
            if active.iter().any(|s| s.id == id) && !next.selected.remove(id) {
                next.selected.insert(id.to_string());
            }
            next
        }

        /// Select every active id, or clear the set when all are already selected.
        #[must_use]
        pub fn all_toggled(&self, active: &[Suggestion]) -> Self {
            if self.is_all_selected(active) {
                Self::default()
            } else {
                Self {
                    selected: active.iter().map(|s| s.id.clone()).collect(),
                }
            }
        }

        #[must_use]
        pub fn cleared(&self) -> Self {
            Self::default()
        }

        /// Drop ids that are no longer active.
        #[must_use]
        pub fn reconciled(&self, active: &[Suggestion]) -> Self {
            Self {
                selected: active
                    .iter()
                    .filter(|s| self.selected.contains(&s.id))
                    .map(|s| s.id.clone())
                    .collect(),
            }
        }

        pub fn is_selected(&self, id: &str, active: &[Suggestion]) -> bool {
            self.selected.contains(id) && active.iter().any(|s| s.id == id)
        }

        pub fn is_all_selected(&self, active: &[Suggestion]) -> bool {
            !active.is_empty() && active.iter().all(|s| self.selected.contains(&s.id))
        }

        pub fn has_any(&self, active: &[Suggestion]) -> bool {
            active.iter().any(|s| self.selected.contains(&s.id))
        }

        /// Selected ids in active-list order.
        pub fn selected_ids<'a>(&self, active: &'a [Suggestion]) -> Vec<&'a str> {
            active
                .iter()
                .filter(|s| self.selected.contains(&s.id))
                .map(|s| s.id.as_str())
                .collect()
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::core::SuggestionKind;

        fn active(ids: &[&str]) -> Vec<Suggestion> {
            ids.iter()
                .map(|id| Suggestion {
                    id: id.to_string(),
                    kind: SuggestionKind::Conflict,
                    title: String::new(),
                    description: String::new(),
                    impact: String::new(),
                    affected_posts: vec![],
                    changes: vec![],
                })
                .collect()
        }

        #[test]
        fn toggle_is_symmetric() {
            let list = active(&["a", "b"]);
            let s = SelectionSet::new().toggled("a", &list);
            assert!(s.is_selected("a", &list));
            assert!(s.has_any(&list));
            let s = s.toggled("a", &list);
            assert!(!s.has_any(&list));
        }

        #[test]
        fn select_all_twice_clears() {
            let list = active(&["a", "b", "c"]);
            let s = SelectionSet::new().toggled("b", &list).all_toggled(&list);
            assert!(s.is_all_selected(&list));
            assert_eq!(s.selected_ids(&list), vec!["a", "b", "c"]);
            let s = s.all_toggled(&list);
            assert!(!s.has_any(&list));
            assert_eq!(s.cleared(), SelectionSet::new());
        }

        #[test]
        fn inactive_ids_are_never_selected() {
            let list = active(&["a"]);
            let s = SelectionSet::new().toggled("gone", &list);
            assert!(!s.has_any(&list));
            assert!(!s.is_selected("gone", &list));
        }

        #[test]
        fn full_selection_goes_stale_when_active_list_shrinks() {
            let before = active(&["a", "b"]);
            let s = SelectionSet::new().all_toggled(&before);
            assert!(s.is_all_selected(&before));

            let after = active(&["c"]);
            assert!(!s.is_all_selected(&after));
            assert!(!s.has_any(&after));
            let s = s.all_toggled(&after);
            assert_eq!(s.selected_ids(&after), vec!["c"]);
        }

        #[test]
        fn empty_active_list_is_never_fully_selected() {
            let s = SelectionSet::new().all_toggled(&[]);
            assert!(!s.is_all_selected(&[]));
            assert!(!s.has_any(&[]));
        }
    }
}

pub mod triage {
    //! Review queue for flagged items.
    //!
    //! Each item is `pending` until one of its permitted actions resolves it, at which
    //! point it leaves the queue. Pending items are ordered critical-first, keeping the
    //! original order within a severity. Transitions return a new queue.

    use crate::core::{FlaggedItem, ResolutionAction, Severity};
    use serde::{Deserialize, Serialize};
    use tracing::info;

    /// Position of the item presented to the reviewer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(tag = "state", content = "index", rename_all = "lowercase")]
    pub enum Cursor {
        Empty,
        At(usize),
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum ResolutionOrigin {
        Single,
        Bulk,
    }

    /// Record of a resolved item, handed back to the caller for logging.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Resolution {
        pub item_id: String,
        pub action: ResolutionAction,
        pub origin: ResolutionOrigin,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
    pub struct SeverityCounts {
        pub critical: usize,
        pub warning: usize,
    }

    /// How bulk resolution treats items that do not list the implied action.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BulkPolicy {
        /// Leave such items pending instead of resolving them.
        pub respect_permissions: bool,
    }

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum TriageError {
        #[error("flagged item {0:?} is not pending")]
        NotPending(String),
        #[error("action {action} is not permitted for flagged item {item_id:?}")]
        ActionNotPermitted {
            item_id: String,
            action: ResolutionAction,
        },
        #[error("the triage queue is empty")]
        Empty,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct TriageQueue {
        pending: Vec<FlaggedItem>,
        cursor: Cursor,
    }

    impl Default for TriageQueue {
        fn default() -> Self {
            Self::new(Vec::new())
        }
    }

    impl TriageQueue {
        pub fn new(items: impl IntoIterator<Item = FlaggedItem>) -> Self {
            let mut pending: Vec<FlaggedItem> = items.into_iter().collect();
            // stable: relative order survives within a severity
            pending.sort_by_key(|item| item.issue.severity);
            let cursor = if pending.is_empty() {
                Cursor::Empty
            } else {
                Cursor::At(0)
            };
            Self { pending, cursor }
        }

        pub fn pending(&self) -> &[FlaggedItem] {
            &self.pending
        }

        pub fn iter(&self) -> impl Iterator<Item = &FlaggedItem> {
            self.pending.iter()
        }

        pub fn len(&self) -> usize {
            self.pending.len()
        }

        pub fn is_empty(&self) -> bool {
            self.pending.is_empty()
        }

        pub fn cursor(&self) -> Cursor {
            self.cursor
        }

        pub fn current(&self) -> Option<&FlaggedItem> {
            match self.cursor {
                Cursor::Empty => None,
                Cursor::At(i) => self.pending.get(i),
            }
        }

        pub fn counts(&self) -> SeverityCounts {
            let mut counts = SeverityCounts::default();
            for item in &self.pending {
                match item.issue.severity {
                    Severity::Critical => counts.critical += 1,
                    Severity::Warning => counts.warning += 1,
                }
            }
            counts
        }

        /// Move the cursor to `index`, clamped into range.
        #[must_use]
        pub fn select(&self, index: usize) -> Self {
            let mut next = self.clone();
            next.cursor = clamp_cursor(index, self.pending.len());
            next
        }

        #[must_use]
        pub fn step_forward(&self) -> Self {
            match self.cursor {
                Cursor::Empty => self.clone(),
                Cursor::At(i) => self.select(i.saturating_add(1)),
            }
        }

        #[must_use]
        pub fn step_back(&self) -> Self {
            match self.cursor {
                Cursor::Empty => self.clone(),
                Cursor::At(i) => self.select(i.saturating_sub(1)),
            }
        }

        /// Resolve one pending item with a permitted action.
        ///
        /// On error the queue is unchanged and the item stays pending.
        pub fn resolve(
            &self,
            item_id: &str,
            action: ResolutionAction,
        ) -> Result<(Self, Resolution), TriageError> {
            let index = self
                .pending
                .iter()
                .position(|item| item.id == item_id)
                .ok_or_else(|| TriageError::NotPending(item_id.to_string()))?;
            if !self.pending[index].permits(action) {
                return Err(TriageError::ActionNotPermitted {
                    item_id: item_id.to_string(),
                    action,
                });
            }

            let mut pending = self.pending.clone();
            let item = pending.remove(index);
            let cursor = cursor_after_removal(self.cursor, index, pending.len());
            info!(item_id = %item.id, %action, remaining = pending.len(), "resolved flagged item");
            Ok((
                Self { pending, cursor },
                Resolution {
                    item_id: item.id,
                    action,
                    origin: ResolutionOrigin::Single,
                },
            ))
        }

        pub fn resolve_current(
            &self,
            action: ResolutionAction,
        ) -> Result<(Self, Resolution), TriageError> {
            let item = self.current().ok_or(TriageError::Empty)?;
            self.resolve(&item.id, action)
        }

        /// Resolve every pending item as accepted.
        pub fn fix_all(&self) -> (Self, Vec<Resolution>) {
            self.resolve_all(ResolutionAction::Accept, BulkPolicy::default())
        }

        /// Resolve every pending item as skipped.
        pub fn dismiss_all(&self) -> (Self, Vec<Resolution>) {
            self.resolve_all(ResolutionAction::Skip, BulkPolicy::default())
        }

        pub fn resolve_all(
            &self,
            action: ResolutionAction,
            policy: BulkPolicy,
        ) -> (Self, Vec<Resolution>) {
            let (resolved, kept): (Vec<FlaggedItem>, Vec<FlaggedItem>) = self
                .pending
                .iter()
                .cloned()
                .partition(|item| !policy.respect_permissions || item.permits(action));
            let resolutions: Vec<Resolution> = resolved
                .into_iter()
                .map(|item| Resolution {
                    item_id: item.id,
                    action,
                    origin: ResolutionOrigin::Bulk,
                })
                .collect();
            info!(
                %action,
                resolved = resolutions.len(),
                remaining = kept.len(),
                "bulk resolved flagged items"
            );
            (Self::new(kept), resolutions)
        }
    }

    fn clamp_cursor(index: usize, len: usize) -> Cursor {
        if len == 0 {
            Cursor::Empty
        } else {
            Cursor::At(index.min(len - 1))
        }
    }

    fn cursor_after_removal(cursor: Cursor, removed: usize, remaining: usize) -> Cursor {
        let position = match cursor {
            Cursor::Empty => 0,
            Cursor::At(p) if p > removed => p - 1,
            Cursor::At(p) => p,
        };
        clamp_cursor(position, remaining)
    }

}

pub mod annotate {
    //! Boundary to the external annotation service.
    //!
    //! One request carries the whole normalized batch; one response carries the
    //! annotated posts, flagged items, suggestions and a status message. Only the
    //! response to the most recent request is accepted.

    use crate::core::{FlaggedItem, ScheduleItem, Suggestion, TaskRecord};
    use crate::schedule::SuggestionBoard;
    use crate::selection::SelectionSet;
    use crate::triage::TriageQueue;
    use serde::{Deserialize, Serialize};
    use serde_json::Value;
    use std::{
        fs,
        path::{Path, PathBuf},
    };
    use tracing::{debug, warn};
    use uuid::Uuid;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct AnnotationRequest {
        pub request_id: Uuid,
        pub tasks: Vec<TaskRecord>,
    }

    #[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct AnnotationResponse {
        #[serde(default, alias = "scheduledPosts")]
        pub posts: Vec<ScheduleItem>,
        #[serde(default, alias = "flaggedItems")]
        pub flagged: Vec<FlaggedItem>,
        #[serde(default)]
        pub suggestions: Vec<Suggestion>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub message: Option<String>,
    }

    #[derive(Debug, thiserror::Error)]
    pub enum AnnotationError {
        /// Message reported by the service, shown to the user as-is.
        #[error("{0}")]
        Upstream(String),
        #[error("malformed annotation response: {0}")]
        Decode(#[from] serde_json::Error),
        #[error("failed to read annotation response {path:?}")]
        Io {
            path: PathBuf,
            #[source]
            source: std::io::Error,
        },
    }

    pub trait Annotator {
        fn annotate(&self, request: &AnnotationRequest) -> Result<AnnotationResponse, AnnotationError>;
    }

    /// Replays a recorded service response from disk.
    ///
    /// A top-level `{"error": "..."}` object is reported as an upstream failure.
    #[derive(Debug, Clone)]
    pub struct FileAnnotator {
        path: PathBuf,
    }

    impl FileAnnotator {
        pub fn new(path: impl Into<PathBuf>) -> Self {
            Self { path: path.into() }
        }

        pub fn path(&self) -> &Path {
            &self.path
        }
    }

    impl Annotator for FileAnnotator {
        fn annotate(&self, request: &AnnotationRequest) -> Result<AnnotationResponse, AnnotationError> {
            debug!(request_id = %request.request_id, tasks = request.tasks.len(), path = ?self.path, "replaying annotation");
            let raw = fs::read_to_string(&self.path).map_err(|source| AnnotationError::Io {
                path: self.path.clone(),
                source,
            })?;
            decode_response(&raw)
        }
    }

    /// Decode a service payload, turning an error envelope into `Upstream`.
    pub fn decode_response(raw: &str) -> Result<AnnotationResponse, AnnotationError> {
        let value: Value = serde_json::from_str(raw)?;
        if let Some(message) = value.get("error").and_then(Value::as_str) {
            return Err(AnnotationError::Upstream(message.to_string()));
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Tracks the latest outstanding request so late responses can be dropped.
    #[derive(Debug, Clone, Default)]
    pub struct AnnotationSession {
        latest: Option<Uuid>,
    }

    impl AnnotationSession {
        pub fn new() -> Self {
            Self::default()
        }

        /// Issue a new request; any earlier request becomes stale.
        pub fn begin(&mut self, tasks: Vec<TaskRecord>) -> AnnotationRequest {
            let request_id = Uuid::new_v4();
            self.latest = Some(request_id);
            AnnotationRequest { request_id, tasks }
        }

        pub fn is_current(&self, request_id: Uuid) -> bool {
            self.latest == Some(request_id)
        }

        /// Pass `outcome` through only when it answers the latest request.
        ///
        /// Callers that send the request themselves (an asynchronous annotator, a
        /// retry after an upstream error) must route the late outcome through here.
        pub fn accept<T>(&self, request_id: Uuid, outcome: T) -> Option<T> {
            if self.is_current(request_id) {
                Some(outcome)
            } else {
                warn!(%request_id, latest = ?self.latest, "ignoring stale annotation response");
                None
            }
        }

        /// Begin a request and send it through a blocking annotator.
        ///
        /// The session stays borrowed for the whole call, so no newer request can be
        /// issued before the response arrives and no staleness check is needed here.
        /// Asynchronous callers use `begin` and `accept` instead.
        pub fn run(
            &mut self,
            annotator: &dyn Annotator,
            tasks: Vec<TaskRecord>,
        ) -> Result<AnnotationResponse, AnnotationError> {
            let request = self.begin(tasks);
            annotator.annotate(&request)
        }
    }

    /// Review state seeded from an annotation response.
    #[derive(Debug, Clone, PartialEq)]
    pub struct ReviewState {
        pub items: Vec<ScheduleItem>,
        pub board: SuggestionBoard,
        pub selection: SelectionSet,
        pub queue: TriageQueue,
        pub message: Option<String>,
    }

    impl From<AnnotationResponse> for ReviewState {
        fn from(response: AnnotationResponse) -> Self {
            Self {
                items: response.posts,
                board: SuggestionBoard::new(response.suggestions),
                selection: SelectionSet::new(),
                queue: TriageQueue::new(response.flagged),
                message: response.message,
            }
        }
    }

}

pub mod config {
    //! Layered configuration: built-in defaults, an optional TOML file, then
    //! `POSTLINE_*` environment variables (`__` separates sections).

    use crate::triage::BulkPolicy;
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };
    use serde::{Deserialize, Serialize};
    use std::path::{Path, PathBuf};

    pub const ENV_PREFIX: &str = "POSTLINE_";

    #[derive(Debug, thiserror::Error)]
    pub enum ConfigError {
        #[error("configuration error: {0}")]
        Figment(#[from] figment::Error),
        #[error("config file {0:?} does not exist")]
        MissingFile(PathBuf),
    }

    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Config {
        #[serde(default)]
        pub import: ImportConfig,
        #[serde(default)]
        pub triage: TriageConfig,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct ImportConfig {
        /// Files larger than this are rejected before reading.
        pub max_file_bytes: u64,
        /// Lowercase extensions accepted for import.
        pub allowed_extensions: Vec<String>,
        /// Physical lines (title, blank) preceding the CSV header.
        pub skip_leading_rows: usize,
        /// Status for rows whose status cell is blank.
        pub default_status: String,
    }

    impl Default for ImportConfig {
        fn default() -> Self {
            Self {
                max_file_bytes: 10 * 1024 * 1024,
                allowed_extensions: vec!["csv".into(), "json".into()],
                skip_leading_rows: 2,
                default_status: "pending".into(),
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(default)]
    pub struct TriageConfig {
        /// Bulk fix/dismiss leaves items pending when they do not list the action.
        pub bulk_respects_permissions: bool,
    }

    impl TriageConfig {
        pub fn bulk_policy(&self) -> BulkPolicy {
            BulkPolicy {
                respect_permissions: self.bulk_respects_permissions,
            }
        }
    }

    impl Config {
        pub fn figment(file: Option<&Path>) -> Figment {
            let mut figment = Figment::from(Serialized::defaults(Self::default()));
            if let Some(path) = file {
                figment = figment.merge(Toml::file(path));
            }
            figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
        }

        /// An explicitly named file must exist; figment would skip it silently.
        pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
            if let Some(path) = file {
                if !path.exists() {
                    return Err(ConfigError::MissingFile(path.to_path_buf()));
                }
            }
            Ok(Self::figment(file).extract()?)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use figment::Jail;
        use pretty_assertions::assert_eq;

        #[test]
        fn defaults_without_sources() {
            Jail::expect_with(|_jail| {
                let config = Config::load(None).expect("config loads");
                assert_eq!(config, Config::default());
                assert_eq!(config.import.max_file_bytes, 10_485_760);
                assert_eq!(config.import.skip_leading_rows, 2);
                assert!(!config.triage.bulk_policy().respect_permissions);
                Ok(())
            });
        }

        #[test]
        fn file_then_env_override() {
            Jail::expect_with(|jail| {
                jail.create_file(
                    "postline.toml",
                    r#"
                    [import]
                    skip_leading_rows = 0
                    default_status = "backlog"

                    [triage]
                    bulk_respects_permissions = true
                    "#,
                )?;
                jail.set_env("POSTLINE_IMPORT__SKIP_LEADING_ROWS", "1");

                let config = Config::load(Some(Path::new("postline.toml"))).expect("config loads");
                assert_eq!(config.import.skip_leading_rows, 1);
                assert_eq!(config.import.default_status, "backlog");
                assert_eq!(config.import.allowed_extensions, vec!["csv", "json"]);
                assert!(config.triage.bulk_respects_permissions);
                Ok(())
            });
        }

        #[test]
        fn named_file_must_exist() {
            Jail::expect_with(|_jail| {
                let err = Config::load(Some(Path::new("absent.toml"))).unwrap_err();
                assert!(matches!(err, ConfigError::MissingFile(_)));
                Ok(())
            });
        }

        #[test]
        fn bad_env_value_is_reported() {
            Jail::expect_with(|jail| {
                jail.set_env("POSTLINE_IMPORT__MAX_FILE_BYTES", "lots");
                assert!(matches!(Config::load(None), Err(ConfigError::Figment(_))));
                Ok(())
            });
        }
    }
}

pub use annotate::{AnnotationSession, Annotator, FileAnnotator, ReviewState};
pub use config::Config;
pub use extract::extract_notes;
pub use import::{ImportError, ImportFormat, Normalizer};
pub use schedule::{SuggestionBoard, apply_changes, detect_conflicts};
pub use selection::SelectionSet;
pub use triage::TriageQueue;
