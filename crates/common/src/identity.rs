// Generated identities for collaborators who have not picked a name or color.

use rand::seq::SliceRandom;
use rand::Rng;

use crate::types::UserProfile;

/// Named cursor colors. Keys are stable; values are the hex codes broadcast to peers.
pub const PALETTE: [(&str, &str); 17] = [
    ("red", "#f87171"),
    ("orange", "#fb923c"),
    ("amber", "#fbbf24"),
    ("yellow", "#facc15"),
    ("lime", "#a3e635"),
    ("green", "#4ade80"),
    ("emerald", "#34d399"),
    ("teal", "#2dd4bf"),
    ("cyan", "#22d3ee"),
    ("sky", "#38bdf8"),
    ("blue", "#60a5fa"),
    ("indigo", "#818cf8"),
    ("violet", "#a78bfa"),
    ("purple", "#c084fc"),
    ("fuchsia", "#e879f9"),
    ("pink", "#f472b6"),
    ("rose", "#fb7185"),
];

const ADJECTIVES: [&str; 24] = [
    "Swift", "Clever", "Bright", "Quick", "Sharp", "Bold", "Calm", "Kind", "Brave", "Wise",
    "Noble", "Mighty", "Gentle", "Fierce", "Silent", "Wild", "Golden", "Silver", "Cosmic",
    "Lucky", "Mystic", "Stellar", "Radiant", "Daring",
];

const ANIMALS: [&str; 24] = [
    "Fox", "Owl", "Bear", "Wolf", "Eagle", "Hawk", "Lion", "Tiger", "Falcon", "Panther",
    "Dolphin", "Phoenix", "Dragon", "Raven", "Lynx", "Otter", "Stag", "Cobra", "Jaguar", "Crane",
    "Badger", "Viper", "Condor", "Gazelle",
];

const AVATAR_BASE: &str = "https://api.dicebear.com/9.x/avataaars/svg?seed=";

const AVATAR_SEEDS: [&str; 20] = [
    "Felix", "Aneka", "Shadow", "Loki", "Bandit", "Misty", "Gizmo", "Samantha", "Abby", "Maggie",
    "Boots", "Precious", "Miss%20kitty", "Snickers", "Mimi", "Sassy", "Simba", "Salem", "Leo",
    "Garfield",
];

/// Resolve a palette key (e.g. `"blue"`) to its hex value.
pub fn color_hex(key: &str) -> Option<&'static str> {
    PALETTE.iter().find(|(name, _)| *name == key).map(|(_, hex)| *hex)
}

/// Accepts either a palette key or a literal `#rrggbb` value.
pub fn resolve_color(value: &str) -> Option<String> {
    if let Some(hex) = color_hex(value) {
        return Some(hex.to_string());
    }
    let digits = value.strip_prefix('#')?;
    if digits.len() == 6 && digits.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(value.to_ascii_lowercase())
    } else {
        None
    }
}

pub fn random_color_with<R: Rng + ?Sized>(rng: &mut R) -> &'static str {
    PALETTE.choose(rng).map(|(key, _)| *key).unwrap_or("blue")
}

pub fn random_name_with<R: Rng + ?Sized>(rng: &mut R) -> String {
    let adjective = ADJECTIVES.choose(rng).copied().unwrap_or("Swift");
    let animal = ANIMALS.choose(rng).copied().unwrap_or("Fox");
    format!("{adjective} {animal}")
}

pub fn random_avatar_with<R: Rng + ?Sized>(rng: &mut R) -> String {
    let seed = AVATAR_SEEDS.choose(rng).copied().unwrap_or("Felix");
    format!("{AVATAR_BASE}{seed}")
}

/// Palette key chosen uniformly at random.
pub fn random_color() -> &'static str {
    random_color_with(&mut rand::thread_rng())
}

/// `"<Adjective> <Animal>"`, e.g. `"Cosmic Otter"`.
pub fn random_name() -> String {
    random_name_with(&mut rand::thread_rng())
}

pub fn random_avatar() -> String {
    random_avatar_with(&mut rand::thread_rng())
}

impl UserProfile {
    /// A complete profile with generated name, palette color and avatar.
    pub fn random() -> Self {
        Self::random_with(&mut rand::thread_rng())
    }

    pub fn random_with<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let color = color_hex(random_color_with(rng)).unwrap_or("#60a5fa");
        Self::new(random_name_with(rng), color).with_avatar(random_avatar_with(rng))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn every_palette_key_resolves() {
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..200 {
            let key = random_color_with(&mut rng);
            assert!(color_hex(key).is_some(), "unknown palette key {key}");
        }
    }

    #[test]
    fn generated_name_is_adjective_then_animal() {
        let mut rng = StdRng::seed_from_u64(3);
        let name = random_name_with(&mut rng);
        let (adjective, animal) = name.split_once(' ').expect("name should have two words");
        assert!(ADJECTIVES.contains(&adjective));
        assert!(ANIMALS.contains(&animal));
    }

    #[test]
    fn seeded_generation_is_deterministic() {
        let a = UserProfile::random_with(&mut StdRng::seed_from_u64(42));
        let b = UserProfile::random_with(&mut StdRng::seed_from_u64(42));
        assert_eq!(a, b);
        assert!(a.avatar.as_deref().is_some_and(|url| url.starts_with(AVATAR_BASE)));
    }

    #[test]
    fn resolve_color_accepts_keys_and_hex() {
        assert_eq!(resolve_color("emerald").as_deref(), Some("#34d399"));
        assert_eq!(resolve_color("#ABCDEF").as_deref(), Some("#abcdef"));
        assert_eq!(resolve_color("#abc"), None);
        assert_eq!(resolve_color("chartreuse"), None);
    }
}
