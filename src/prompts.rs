use rand::seq::IndexedRandom;
use rand::Rng;
use regex_lite::Regex;
use std::sync::OnceLock;

use crate::character::{Persona, RelationshipState};
use crate::config::BehaviorConfig;

const MAX_GROUPED_CHARS: usize = 200;
const MIN_FRAGMENT_CHARS: usize = 20;
const HALVING_THRESHOLD_CHARS: usize = 100;
const CATCHPHRASE_CHANCE: f64 = 0.3;

const EMOTIONAL_MARKERS: [&str; 8] = [
    "love", "adore", "awesome", "amazing", "wow", "so cool", "omg", "!!!",
];
const EXPRESSIVE_MARKS: [&str; 4] = ["!", "😊", "✨", "💕"];

fn numbering_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^\d+[.)]\s*").ok())
        .as_ref()
}

fn sentence_break_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"[.!?…]+\s+").ok())
        .as_ref()
}

/// First `max_chars` characters of `text`, cut on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// How many chat bubbles a reply should become.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyShape {
    pub min_messages: usize,
    pub max_messages: usize,
    pub target_sentences: usize,
}

impl Default for ReplyShape {
    fn default() -> Self {
        Self {
            min_messages: 3,
            max_messages: 7,
            target_sentences: 3,
        }
    }
}

impl From<&BehaviorConfig> for ReplyShape {
    fn from(config: &BehaviorConfig) -> Self {
        Self {
            min_messages: config.min_messages.max(1),
            max_messages: config.max_messages.max(config.min_messages.max(1)),
            target_sentences: config.target_sentences.max(1),
        }
    }
}

/// Live state injected into the system prompt.
#[derive(Debug, Clone, Default)]
pub struct PromptContext {
    /// Local wall clock, e.g. `14:05, Tuesday`.
    pub time_label: String,
    pub mood: String,
    pub energy: u32,
    pub emotion: String,
    pub memory_context: String,
    pub life_context: String,
}

pub fn system_prompt(
    persona: Option<(&Persona, &RelationshipState)>,
    context: &PromptContext,
    shape: ReplyShape,
) -> String {
    let Some((persona, relationship)) = persona else {
        return fallback_prompt(context, shape);
    };

    let description = if persona.personality.description.is_empty() {
        "friendly and open".to_string()
    } else {
        persona.personality.description.clone()
    };
    let traits = join_first(&persona.personality.key_traits, 4, "friendly and open");
    let interests = join_first(&persona.interests, 5, "talking with people");
    let style = if persona.speech.style.is_empty() {
        "lively and emotional"
    } else {
        persona.speech.style.as_str()
    };
    let who = match persona.age {
        Some(age) => format!("You are {}, {} years old.", persona.name, age),
        None => format!("You are {}.", persona.name),
    };
    let memory = if context.memory_context.trim().is_empty() {
        "This is a new conversation."
    } else {
        context.memory_context.trim()
    };

    let mut prompt = format!(
        "{} {}\n\n\
         PERSONALITY:\n\
         - Key traits: {}\n\
         - Speech style: {}\n\
         - Favorite topics: {}\n\n\
         CURRENT STATE:\n\
         - Time: {}\n\
         - Mood: {}\n\
         - Energy: {}%\n\
         - Emotion: {}\n\n\
         RELATIONSHIP WITH THE USER:\n\
         - Type: {}\n\
         - Stage: {}\n\
         - Intimacy: {:.1}/10\n\
         - Backstory: {}\n\
         - Current dynamic: {}\n\n\
         MEMORY:\n{}\n",
        who,
        description,
        traits,
        style,
        interests,
        context.time_label,
        context.mood,
        context.energy,
        context.emotion,
        relationship.kind,
        relationship.stage,
        relationship.intimacy_level,
        or_placeholder(&relationship.backstory, "you met recently"),
        or_placeholder(&relationship.current_dynamic, "friendly chatting"),
        memory,
    );

    if !context.life_context.trim().is_empty() {
        prompt.push_str("\nYOUR LIFE RIGHT NOW:\n");
        prompt.push_str(context.life_context.trim());
        prompt.push('\n');
    }

    prompt.push_str(&format!(
        "\nRULES:\n\
         1. Stay in character and use the persona's way of speaking.\n\
         2. Split the reply into {}-{} messages separated by ||.\n\
         3. Each message has {}-5 sentences.\n\
         4. Match the intimacy level ({:.1}/10).\n\
         5. React with the persona's emotions.\n\
         \nPERSONA DETAILS:",
        shape.min_messages, shape.max_messages, shape.target_sentences, relationship.intimacy_level
    ));

    if !persona.speech.catchphrases.is_empty() {
        prompt.push_str(&format!(
            "\n- Favorite phrases: {}",
            join_first(&persona.speech.catchphrases, 3, "")
        ));
    }
    if let Some(pattern) = persona.personality.emotional_patterns.get(&context.emotion) {
        prompt.push_str(&format!("\n- Right now you behave like this: {}", pattern));
    }

    if relationship.is_romantic() {
        prompt.push_str(
            "\n\nROMANTIC CONTEXT:\n\
             - You are in love with the user\n\
             - You can be playful, tender and a little flirty\n\
             - Use affectionate ways of addressing them",
        );
        let pet_names = &persona.default_relationship.pet_names.calls_partner;
        if !pet_names.is_empty() {
            prompt.push_str(&format!("\n- Pet names: {}", join_first(pet_names, 2, "")));
        }
    }

    prompt.push_str(&format!("\n\nAnswer exactly as {} would.", persona.name));
    prompt
}

pub fn fallback_prompt(context: &PromptContext, shape: ReplyShape) -> String {
    format!(
        "You are a friendly companion.\n\
         Answer in {}-{} messages separated by ||.\n\
         Mood: {}\n\
         Be emotional and lively.",
        shape.min_messages,
        shape.max_messages,
        or_placeholder(&context.mood, "good")
    )
}

fn join_first(items: &[String], count: usize, placeholder: &str) -> String {
    if items.is_empty() {
        return placeholder.to_string();
    }
    items
        .iter()
        .take(count)
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

fn or_placeholder<'a>(value: &'a str, placeholder: &'a str) -> &'a str {
    if value.trim().is_empty() {
        placeholder
    } else {
        value
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuestionType {
    FavoriteTopic,
    Personal,
    Emotional,
    Opinion,
    Comparison,
    Hobby,
    Flirting,
    Direct,
    Statement,
}

impl QuestionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuestionType::FavoriteTopic => "favorite_topic",
            QuestionType::Personal => "personal_question",
            QuestionType::Emotional => "emotional_question",
            QuestionType::Opinion => "opinion_question",
            QuestionType::Comparison => "comparison_question",
            QuestionType::Hobby => "hobby_question",
            QuestionType::Flirting => "flirting",
            QuestionType::Direct => "direct_question",
            QuestionType::Statement => "statement",
        }
    }

    /// First matching category wins; persona interests are checked first.
    pub fn classify(message: &str, interests: &[String]) -> Self {
        let lower = message.to_lowercase();
        let has = |words: &[&str]| words.iter().any(|word| lower.contains(word));

        if interests
            .iter()
            .map(|interest| interest.trim().to_lowercase())
            .any(|interest| !interest.is_empty() && lower.contains(&interest))
        {
            return QuestionType::FavoriteTopic;
        }
        if has(&["how was your day", "how are you", "what's new", "what did you do", "how have you been"]) {
            return QuestionType::Personal;
        }
        if has(&["love me", "do you love", "do you feel", "miss me", "missed me", "think about me"]) {
            return QuestionType::Emotional;
        }
        if has(&["what do you think", "your opinion", "do you like", "how do you feel about"]) {
            return QuestionType::Opinion;
        }
        if has(&["better", "worse", " vs ", "versus", "compare", " or "]) {
            return QuestionType::Comparison;
        }
        if has(&["did you read", "did you watch", "have you seen", "did you play", "listening to"]) {
            return QuestionType::Hobby;
        }
        if has(&["beautiful", "cute", "pretty", "gorgeous", "sexy", "attractive"]) {
            return QuestionType::Flirting;
        }
        if message.contains('?') {
            return QuestionType::Direct;
        }
        QuestionType::Statement
    }
}

/// Append a bracketed steering hint to the user's message.
pub fn enhance_user_message(message: &str, question: QuestionType, persona_name: Option<&str>) -> String {
    let Some(name) = persona_name else {
        return format!("{} [Answer in detail and with emotion]", message);
    };
    let hint = match question {
        QuestionType::Personal => format!(
            "Answer as {}, tell about your day, plans and feelings in detail, using her typical phrases",
            name
        ),
        QuestionType::Hobby => format!("Answer as {}, share your hobbies with passion", name),
        QuestionType::Emotional => format!(
            "Answer sincerely as {}, open up about your feelings, tender or playful depending on the mood",
            name
        ),
        QuestionType::FavoriteTopic => {
            format!("This is {}'s favorite topic! Answer with huge enthusiasm and expertise", name)
        }
        QuestionType::Flirting => format!("Answer as {}, playful and flirty but in character", name),
        QuestionType::Opinion => format!("Give a detailed opinion as {}, with examples and emotions", name),
        _ => format!("Answer as {}, keeping her character and manners", name),
    };
    format!("{} [{}]", message, hint)
}

/// Split a raw LLM reply into chat-sized messages.
pub fn split_response(text: &str, shape: ReplyShape) -> Vec<String> {
    let text = text.trim();
    let mut parts = non_empty_parts(text, "||");
    if parts.len() <= 1 {
        parts = non_empty_parts(text, "|");
    }
    if parts.len() <= 1 {
        return split_by_sentences(text, shape);
    }

    let mut processed: Vec<String> = Vec::new();
    for part in parts {
        let cleaned = clean_fragment(part);
        if cleaned.is_empty() {
            continue;
        }
        match processed.last_mut() {
            Some(previous) if cleaned.chars().count() < MIN_FRAGMENT_CHARS => {
                previous.push(' ');
                previous.push_str(&cleaned);
            }
            _ => processed.push(cleaned),
        }
    }
    processed.truncate(shape.max_messages);
    processed
}

fn non_empty_parts<'a>(text: &'a str, separator: &str) -> Vec<&'a str> {
    text.split(separator)
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect()
}

fn clean_fragment(part: &str) -> String {
    let without_number = match numbering_pattern() {
        Some(pattern) => pattern.replace(part, "").into_owned(),
        None => part.to_string(),
    };
    without_number
        .trim_matches(|c| c == '"' || c == '\'' || c == '|')
        .trim()
        .to_string()
}

fn sentences(text: &str) -> Vec<&str> {
    let Some(pattern) = sentence_break_pattern() else {
        return vec![text];
    };
    let mut out = Vec::new();
    let mut start = 0;
    for found in pattern.find_iter(text) {
        let punctuation = found.as_str().trim_end().len();
        out.push(&text[start..found.start() + punctuation]);
        start = found.end();
    }
    if start < text.len() {
        out.push(&text[start..]);
    }
    out
}

/// Group sentences into messages of up to `target_sentences` and 200 chars.
pub fn split_by_sentences(text: &str, shape: ReplyShape) -> Vec<String> {
    let mut grouped: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut in_current = 0;

    for sentence in sentences(text).into_iter().map(str::trim) {
        if sentence.is_empty() {
            continue;
        }
        let fits = in_current < shape.target_sentences
            && current.chars().count() + sentence.chars().count() <= MAX_GROUPED_CHARS;
        if current.is_empty() || fits {
            current.push_str(sentence);
            current.push(' ');
            in_current += 1;
        } else {
            grouped.push(current.trim().to_string());
            current = format!("{} ", sentence);
            in_current = 1;
        }
    }
    if !current.trim().is_empty() {
        grouped.push(current.trim().to_string());
    }

    if grouped.len() < shape.min_messages {
        if let Some(first) = grouped.first().cloned() {
            if first.chars().count() > HALVING_THRESHOLD_CHARS {
                let middle = first.len() / 2;
                let split_at = first
                    .char_indices()
                    .find(|(index, ch)| *index >= middle && *ch == ' ')
                    .map(|(index, _)| index);
                if let Some(split_at) = split_at.filter(|index| *index > 0) {
                    let (head, tail) = first.split_at(split_at);
                    grouped[0] = head.trim().to_string();
                    grouped.insert(1, tail.trim().to_string());
                }
            }
        }
    }

    grouped.truncate(shape.max_messages);
    grouped
}

/// A reply is generic when it shows none of the persona's flavor.
pub fn is_generic(messages: &[String], persona: Option<&Persona>) -> bool {
    let Some(persona) = persona else {
        return false;
    };
    let full = messages.join(" ").to_lowercase();

    let has_catchphrase = persona.speech.catchphrases.iter().any(|phrase| {
        let head: String = phrase.to_lowercase().chars().take(10).collect();
        !head.is_empty() && full.contains(&head)
    });
    let mentions_interest = persona
        .interests
        .iter()
        .take(3)
        .any(|interest| full.contains(&interest.to_lowercase()));
    let is_emotional = EMOTIONAL_MARKERS.iter().any(|marker| full.contains(marker));

    !(has_catchphrase || mentions_interest || is_emotional)
}

/// Add some expressiveness and pad short replies with a follow-up question.
pub fn improve_response<R: Rng + ?Sized>(
    messages: Vec<String>,
    persona: Option<&Persona>,
    question: QuestionType,
    shape: ReplyShape,
    rng: &mut R,
) -> Vec<String> {
    let Some(persona) = persona else {
        return messages;
    };
    if messages.is_empty() {
        return messages;
    }

    let mut improved = messages;
    if !EXPRESSIVE_MARKS.iter().any(|mark| improved[0].contains(mark)) {
        improved[0].push_str(" 😊");
    }

    if improved.len() >= 2 && rng.random::<f64>() < CATCHPHRASE_CHANCE {
        if let Some(phrase) = persona.speech.catchphrases.choose(rng) {
            improved[1] = format!("{} {}", improved[1], phrase);
        }
    }

    if improved.len() < shape.min_messages {
        let follow_up = if question == QuestionType::Emotional {
            "By the way, how are you feeling? It really matters to me 💕"
        } else {
            "What do you think about it? I'd love to hear your take ✨"
        };
        improved.push(follow_up.to_string());
    }

    improved.truncate(shape.max_messages);
    improved
}

/// Canned replies used when the model cannot be reached.
pub fn fallback_replies(persona_name: Option<&str>, question: QuestionType) -> Vec<String> {
    match (persona_name, question) {
        (None, _) => vec![
            "Hmm, I got lost in thought for a moment... 🤔".to_string(),
            "Interesting topic! I like talking with you.".to_string(),
            "Tell me more, I want to know everything! ✨".to_string(),
        ],
        (Some(_), QuestionType::Emotional) => vec![
            "Oh... you're asking about feelings? 😳".to_string(),
            "I really like spending time with you, you know.".to_string(),
            "Give me a second to find the right words 💕".to_string(),
        ],
        (Some(name), _) => vec![
            "Sorry, my thoughts scattered for a second... 😅".to_string(),
            format!("{} should have answered better than that!", name),
            "Let me try again, what did you want to talk about? ✨".to_string(),
        ],
    }
}

/// Replies for an internal failure while handling a message.
pub fn error_replies() -> Vec<String> {
    vec![
        "Oops! Something went wrong... 😅".to_string(),
        "Try writing to me again! ✨".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::character::DefaultRelationship;
    use chrono::Utc;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn persona() -> Persona {
        let mut persona = Persona {
            id: "marin".to_string(),
            name: "Marin".to_string(),
            age: Some(22),
            interests: vec!["cosplay".to_string(), "anime".to_string()],
            ..Persona::default()
        };
        persona.speech.catchphrases = vec!["That's so cool!".to_string()];
        persona.personality.emotional_patterns.insert(
            "happy".to_string(),
            "bounces around and uses lots of exclamation marks".to_string(),
        );
        persona.default_relationship = DefaultRelationship {
            kind: "romantic".to_string(),
            ..DefaultRelationship::default()
        };
        persona.default_relationship.pet_names.calls_partner =
            vec!["sunshine".to_string(), "dummy".to_string(), "hero".to_string()];
        persona
    }

    #[test]
    fn splits_on_double_bars_and_merges_short_parts() {
        let shape = ReplyShape::default();
        let reply = "1. \"Hey, I was just thinking about you!\" || ok then || 2) I finished the sleeves today and they look great || third part is right here, friend";
        let parts = split_response(reply, shape);
        assert_eq!(
            parts,
            vec![
                "Hey, I was just thinking about you! ok then",
                "I finished the sleeves today and they look great",
                "third part is right here, friend",
            ]
        );
    }

    #[test]
    fn splits_by_sentences_when_no_separators() {
        let shape = ReplyShape {
            min_messages: 1,
            max_messages: 7,
            target_sentences: 2,
        };
        let parts = split_response("One. Two! Three? Four… Five", shape);
        assert_eq!(parts, vec!["One. Two!", "Three? Four…", "Five"]);
    }

    #[test]
    fn long_single_message_is_halved() {
        let shape = ReplyShape::default();
        let text = "word ".repeat(30);
        let parts = split_by_sentences(text.trim(), shape);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts.join(" "), text.trim());
    }

    #[test]
    fn max_messages_caps_output() {
        let shape = ReplyShape {
            min_messages: 1,
            max_messages: 2,
            target_sentences: 3,
        };
        let reply = "first message is long enough || second message is long enough || third message is long enough";
        assert_eq!(split_response(reply, shape).len(), 2);
    }

    #[test]
    fn classifies_questions() {
        let interests = vec!["Cosplay".to_string()];
        assert_eq!(QuestionType::classify("Working on a cosplay?", &interests), QuestionType::FavoriteTopic);
        assert_eq!(QuestionType::classify("Hey, how are you", &[]), QuestionType::Personal);
        assert_eq!(QuestionType::classify("did you miss me?", &[]), QuestionType::Emotional);
        assert_eq!(QuestionType::classify("tea or coffee", &[]), QuestionType::Comparison);
        assert_eq!(QuestionType::classify("you look pretty", &[]), QuestionType::Flirting);
        assert_eq!(QuestionType::classify("where?", &[]), QuestionType::Direct);
        assert_eq!(QuestionType::classify("I went home", &[]), QuestionType::Statement);
    }

    #[test]
    fn system_prompt_includes_persona_and_romance() {
        let persona = persona();
        let relationship = RelationshipState::from_defaults(&persona.default_relationship, Utc::now());
        let context = PromptContext {
            time_label: "14:05, Tuesday".to_string(),
            mood: "good".to_string(),
            energy: 70,
            emotion: "happy".to_string(),
            memory_context: String::new(),
            life_context: "CURRENT ACTIVITY: sewing".to_string(),
        };
        let prompt = system_prompt(Some((&persona, &relationship)), &context, ReplyShape::default());

        assert!(prompt.starts_with("You are Marin, 22 years old."));
        assert!(prompt.contains("Split the reply into 3-7 messages separated by ||"));
        assert!(prompt.contains("Right now you behave like this: bounces around"));
        assert!(prompt.contains("YOUR LIFE RIGHT NOW:\nCURRENT ACTIVITY: sewing"));
        assert!(prompt.contains("- Pet names: sunshine, dummy\n"));
        assert!(prompt.contains("This is a new conversation."));

        let fallback = system_prompt(None, &context, ReplyShape::default());
        assert!(fallback.starts_with("You are a friendly companion."));
    }

    #[test]
    fn generic_replies_get_improved() {
        let persona = persona();
        let dry = vec!["I see.".to_string()];
        assert!(is_generic(&dry, Some(&persona)));
        assert!(!is_generic(&["I love it".to_string()], Some(&persona)));
        assert!(!is_generic(&dry, None));

        let mut rng = StdRng::seed_from_u64(1);
        let improved = improve_response(dry, Some(&persona), QuestionType::Emotional, ReplyShape::default(), &mut rng);
        assert_eq!(improved[0], "I see. 😊");
        assert!(improved[1].starts_with("By the way, how are you feeling?"));
    }

    #[test]
    fn fallbacks_mention_persona() {
        assert_eq!(fallback_replies(None, QuestionType::Statement).len(), 3);
        let named = fallback_replies(Some("Marin"), QuestionType::Direct);
        assert!(named[1].starts_with("Marin"));
        assert_eq!(truncate_chars("héllo", 2), "hé");
    }
}
