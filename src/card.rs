use rand::Rng;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suit {
    Hearts,
    Diamonds,
    Clubs,
    Spades,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Rank {
    Two = 2,
    Three,
    Four,
    Five,
    Six,
    Seven,
    Eight,
    Nine,
    Ten,
    Jack,
    Queen,
    King,
    Ace,
}

pub const ALL_SUITS: [Suit; 4] = [Suit::Hearts, Suit::Diamonds, Suit::Clubs, Suit::Spades];
pub const ALL_RANKS: [Rank; 13] = [
    Rank::Two,
    Rank::Three,
    Rank::Four,
    Rank::Five,
    Rank::Six,
    Rank::Seven,
    Rank::Eight,
    Rank::Nine,
    Rank::Ten,
    Rank::Jack,
    Rank::Queen,
    Rank::King,
    Rank::Ace,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Card {
    pub rank: Rank,
    pub suit: Suit,
}

impl Card {
    /// Draws a uniformly random card, with replacement. No shoe is modeled,
    /// so the same card can appear in several hands at once.
    pub fn random<R: Rng>(rng: &mut R) -> Self {
        Self {
            rank: ALL_RANKS[rng.gen_range(0..ALL_RANKS.len())],
            suit: ALL_SUITS[rng.gen_range(0..ALL_SUITS.len())],
        }
    }
}

impl Rank {
    /// Blackjack value of the rank; aces start at 11 and are softened by
    /// `hand_value`.
    pub fn value(self) -> u32 {
        match self {
            Rank::Jack | Rank::Queen | Rank::King => 10,
            Rank::Ace => 11,
            rank => rank as u32,
        }
    }

    fn code(self) -> &'static str {
        match self {
            Rank::Two => "2",
            Rank::Three => "3",
            Rank::Four => "4",
            Rank::Five => "5",
            Rank::Six => "6",
            Rank::Seven => "7",
            Rank::Eight => "8",
            Rank::Nine => "9",
            Rank::Ten => "10",
            Rank::Jack => "J",
            Rank::Queen => "Q",
            Rank::King => "K",
            Rank::Ace => "A",
        }
    }
}

impl Suit {
    fn code(self) -> char {
        match self {
            Suit::Hearts => 'H',
            Suit::Diamonds => 'D',
            Suit::Clubs => 'C',
            Suit::Spades => 'S',
        }
    }
}

impl fmt::Display for Card {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.rank.code(), self.suit.code())
    }
}

impl FromStr for Card {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !s.is_ascii() || s.len() < 2 {
            return Err(format!("malformed card code: {s}"));
        }
        let (rank_code, suit_code) = s.split_at(s.len() - 1);
        let rank = ALL_RANKS
            .into_iter()
            .find(|r| r.code() == rank_code)
            .ok_or_else(|| format!("unknown rank: {s}"))?;
        let suit = ALL_SUITS
            .into_iter()
            .find(|c| c.code().to_string() == suit_code)
            .ok_or_else(|| format!("unknown suit: {s}"))?;
        Ok(Self { rank, suit })
    }
}

/// Blackjack hand value: every ace counts 11 first, then aces are demoted
/// to 1 while the total exceeds 21.
pub fn hand_value(cards: &[Card]) -> u32 {
    let mut sum = 0;
    let mut aces = 0;
    for card in cards {
        sum += card.rank.value();
        if card.rank == Rank::Ace {
            aces += 1;
        }
    }
    while sum > 21 && aces > 0 {
        sum -= 10;
        aces -= 1;
    }
    sum
}

/// Renders a hand for the wire: `;`-joined card codes, or the literal `NO`
/// when the hand is empty.
pub fn render_hand(cards: &[Card]) -> String {
    if cards.is_empty() {
        return "NO".to_string();
    }
    cards
        .iter()
        .map(Card::to_string)
        .collect::<Vec<_>>()
        .join(";")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn hand(codes: &[&str]) -> Vec<Card> {
        codes.iter().map(|c| c.parse().unwrap()).collect()
    }

    #[test]
    fn ace_plus_ten_is_twenty_one() {
        assert_eq!(hand_value(&hand(&["AH", "KS"])), 21);
        assert_eq!(hand_value(&hand(&["AD", "10C"])), 21);
    }

    #[test]
    fn three_aces_count_thirteen() {
        assert_eq!(hand_value(&hand(&["AH", "AD", "AS"])), 13);
    }

    #[test]
    fn aces_soften_one_at_a_time() {
        assert_eq!(hand_value(&hand(&["AH", "9D"])), 20);
        assert_eq!(hand_value(&hand(&["AH", "9D", "KC"])), 20);
        assert_eq!(hand_value(&hand(&["AH", "9D", "KC", "5S"])), 25);
    }

    #[test]
    fn face_cards_count_ten() {
        assert_eq!(hand_value(&hand(&["JH", "QD", "KS"])), 30);
    }

    #[test]
    fn empty_hand_renders_no() {
        assert_eq!(render_hand(&[]), "NO");
    }

    #[test]
    fn hand_renders_semicolon_joined() {
        assert_eq!(render_hand(&hand(&["10H", "AS"])), "10H;AS");
    }

    #[test]
    fn card_code_round_trip() {
        for suit in ALL_SUITS {
            for rank in ALL_RANKS {
                let card = Card { rank, suit };
                assert_eq!(card.to_string().parse::<Card>().unwrap(), card);
            }
        }
    }

    fn card_strategy() -> impl Strategy<Value = Card> {
        (0..ALL_RANKS.len(), 0..ALL_SUITS.len()).prop_map(|(r, s)| Card {
            rank: ALL_RANKS[r],
            suit: ALL_SUITS[s],
        })
    }

    proptest! {
        /// Hand value does not depend on the order cards were drawn in.
        #[test]
        fn prop_hand_value_is_order_invariant(mut cards in prop::collection::vec(card_strategy(), 0..8)) {
            let forward = hand_value(&cards);
            cards.reverse();
            prop_assert_eq!(hand_value(&cards), forward);
        }

        /// The value never drops below the all-aces-hard minimum, and a
        /// bust hand is exactly that minimum (every ace already demoted).
        #[test]
        fn prop_hand_value_bounds(cards in prop::collection::vec(card_strategy(), 1..8)) {
            let value = hand_value(&cards);
            let hard_minimum: u32 = cards
                .iter()
                .map(|c| if c.rank == Rank::Ace { 1 } else { c.rank.value() })
                .sum();
            prop_assert!(value >= hard_minimum);
            if value > 21 {
                prop_assert_eq!(value, hard_minimum);
            }
        }
    }
}
