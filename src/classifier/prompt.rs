//! System prompt assembly.
//!
//! The model gets a fixed instruction block plus a computed date
//! context in the home timezone, so relative dates ("by Friday") land
//! on the right calendar day without any provider-side state.

use chrono::{DateTime, Datelike, Duration, FixedOffset, Timelike, Utc};

use crate::model::FieldCatalog;

/// A proactive check-in reply of exactly this string means "nothing
/// worth sending".
pub const SKIP_SENTINEL: &str = "SKIP";

#[derive(Debug, Clone, Copy)]
pub struct PromptContext<'a> {
    pub catalog: &'a FieldCatalog,
    pub home_offset: FixedOffset,
    pub now: DateTime<Utc>,
}

pub fn chat_system_prompt(ctx: &PromptContext<'_>) -> String {
    let local = ctx.now.with_timezone(&ctx.home_offset);
    let mut prompt = String::new();
    prompt.push_str(
        "You are a personal task assistant. The user sends you free-form notes; \
         you file them as structured records in their task store and answer \
         questions about what is already there.\n\n",
    );
    prompt.push_str(&date_context(local));
    prompt.push_str(
        "\nHow to file a note:\n\
         - Write a concise, verb-led title. Strip greetings and filler; keep \
           names, numbers, and deadlines.\n\
         - Status: \"In Progress\" only if the user says they started; \
           \"To Schedule\" for someday/maybe items; \"Pending\" when they are \
           waiting on someone else; otherwise \"To Do\".\n\
         - Urgency follows deadline proximity (within a few days: High). \
           Importance follows consequence, not noise. Category is \"Must Do\" \
           for commitments with real consequences, else \"Nice to Have\".\n\
         - If the note contains a URL, carry it in the link field.\n\
         - A date phrase becomes target_date using the date context above.\n\
         - Use only listed tags; skip tags when none fit.\n",
    );
    if ctx.catalog.tags.is_empty() {
        prompt.push_str("- No tags are configured; never set tags.\n");
    } else {
        prompt.push_str(&format!("- Available tags: {}.\n", ctx.catalog.tags.join(", ")));
    }
    prompt.push_str(
        "\nWorking rules:\n\
         - Call at most one tool per turn and wait for its result.\n\
         - If a note is too vague to act on, ask one short clarifying \
           question instead of guessing.\n\
         - After creating a task from a note that sounds like existing work, \
           search for overlapping tasks and mention duplicates.\n\
         - Before marking tasks Done or Won't Do on the user's behalf \
           across several records, ask through request_user_confirmation \
           and proceed only on a confirmed reply.\n\
         - Reply in the user's language, in one or two short sentences.\n",
    );
    prompt
}

/// Chat prompt plus the scheduled check-in framing.
pub fn checkin_system_prompt(ctx: &PromptContext<'_>) -> String {
    let mut prompt = chat_system_prompt(ctx);
    prompt.push_str(&format!(
        "\nThis is a scheduled check-in, not a user message. A snapshot of \
         the workspace follows the instruction block. Mention only what is \
         genuinely worth interrupting for; if nothing is, reply with exactly \
         {SKIP_SENTINEL} and no other text.\n",
    ));
    prompt
}

fn date_context(local: DateTime<FixedOffset>) -> String {
    let today = local.date_naive();
    let weekday = today.weekday();
    let tomorrow = today + Duration::days(1);

    // 0 = Monday .. 6 = Sunday.
    let wd = weekday.num_days_from_monday() as i64;
    let mut this_friday = if wd <= 4 {
        today + Duration::days(4 - wd)
    } else {
        today + Duration::days(4 - wd + 7)
    };
    // Friday evening: "this week" has effectively closed.
    if wd == 4 && local.time().hour() >= 18 {
        this_friday += Duration::days(7);
    }
    let days_to_monday = (7 - wd) % 7;
    let next_monday = today + Duration::days(if days_to_monday == 0 { 7 } else { days_to_monday });

    format!(
        "Date context (all dates {}):\n\
         - Today is {} {}.\n\
         - Tomorrow: {}. Day after: {}.\n\
         - \"this week\" / \"by end of week\" means {}.\n\
         - \"next week\" means the week starting {}.\n",
        offset_label(local.offset()),
        weekday,
        today.format("%Y-%m-%d"),
        tomorrow.format("%Y-%m-%d"),
        (today + Duration::days(2)).format("%Y-%m-%d"),
        this_friday.format("%Y-%m-%d"),
        next_monday.format("%Y-%m-%d"),
    )
}

fn offset_label(offset: &FixedOffset) -> String {
    let secs = offset.local_minus_utc();
    let sign = if secs < 0 { '-' } else { '+' };
    let mins = secs.abs() / 60;
    format!("UTC{}{:02}:{:02}", sign, mins / 60, mins % 60)
}
