use serde::{Deserialize, Serialize};

/// One of the eight three-line primitives, in Earlier Heaven (先天) order.
///
/// Lines are numbered bottom to top; in [`Trigram::bits`] line 1 is bit 0 and
/// a set bit is a solid (yang) line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Trigram {
    Qian,
    Dui,
    Li,
    Zhen,
    Xun,
    Kan,
    Gen,
    Kun,
}

impl Trigram {
    pub const ALL: [Trigram; 8] = [
        Trigram::Qian,
        Trigram::Dui,
        Trigram::Li,
        Trigram::Zhen,
        Trigram::Xun,
        Trigram::Kan,
        Trigram::Gen,
        Trigram::Kun,
    ];

    /// Position in Earlier Heaven order, 1..=8.
    pub fn index(self) -> u8 {
        match self {
            Trigram::Qian => 1,
            Trigram::Dui => 2,
            Trigram::Li => 3,
            Trigram::Zhen => 4,
            Trigram::Xun => 5,
            Trigram::Kan => 6,
            Trigram::Gen => 7,
            Trigram::Kun => 8,
        }
    }

    /// Inverse of [`Trigram::index`]. Any value is reduced into 1..=8 first,
    /// with a zero remainder meaning 8.
    pub fn from_index(n: u32) -> Self {
        match n % 8 {
            1 => Trigram::Qian,
            2 => Trigram::Dui,
            3 => Trigram::Li,
            4 => Trigram::Zhen,
            5 => Trigram::Xun,
            6 => Trigram::Kan,
            7 => Trigram::Gen,
            _ => Trigram::Kun,
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            Trigram::Qian => 0b111,
            Trigram::Dui => 0b011,
            Trigram::Li => 0b101,
            Trigram::Zhen => 0b001,
            Trigram::Xun => 0b110,
            Trigram::Kan => 0b010,
            Trigram::Gen => 0b100,
            Trigram::Kun => 0b000,
        }
    }

    /// Only the low three bits are read.
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0b111 {
            0b111 => Trigram::Qian,
            0b011 => Trigram::Dui,
            0b101 => Trigram::Li,
            0b001 => Trigram::Zhen,
            0b110 => Trigram::Xun,
            0b010 => Trigram::Kan,
            0b100 => Trigram::Gen,
            _ => Trigram::Kun,
        }
    }

    /// The trigram obtained by turning `line` (1..=3 within this trigram)
    /// from solid to broken or back.
    pub fn flip(self, line: u8) -> Self {
        Self::from_bits(self.bits() ^ (1 << ((line.saturating_sub(1)) % 3)))
    }

    pub fn name(self) -> &'static str {
        match self {
            Trigram::Qian => "乾",
            Trigram::Dui => "兑",
            Trigram::Li => "离",
            Trigram::Zhen => "震",
            Trigram::Xun => "巽",
            Trigram::Kan => "坎",
            Trigram::Gen => "艮",
            Trigram::Kun => "坤",
        }
    }
}

/// Hexagram names indexed `[upper][lower]`, both in Earlier Heaven order.
const HEXAGRAMS: [[&str; 8]; 8] = [
    // upper 乾
    ["乾", "履", "同人", "无妄", "姤", "讼", "遯", "否"],
    // upper 兑
    ["夬", "兑", "革", "随", "大过", "困", "咸", "萃"],
    // upper 离
    ["大有", "睽", "离", "噬嗑", "鼎", "未济", "旅", "晋"],
    // upper 震
    ["大壮", "归妹", "丰", "震", "恒", "解", "小过", "豫"],
    // upper 巽
    ["小畜", "中孚", "家人", "益", "巽", "涣", "渐", "观"],
    // upper 坎
    ["需", "节", "既济", "屯", "井", "坎", "蹇", "比"],
    // upper 艮
    ["大畜", "损", "贲", "颐", "蛊", "蒙", "艮", "剥"],
    // upper 坤
    ["泰", "临", "明夷", "复", "升", "师", "谦", "坤"],
];

/// Name of the hexagram with `upper` stacked over `lower`.
pub fn hexagram_name(upper: Trigram, lower: Trigram) -> &'static str {
    HEXAGRAMS[usize::from(upper.index() - 1)][usize::from(lower.index() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn bits_round_trip_for_every_trigram() {
        for t in Trigram::ALL {
            assert_eq!(Trigram::from_bits(t.bits()), t);
        }
    }

    #[test]
    fn index_round_trip_for_every_trigram() {
        for t in Trigram::ALL {
            assert_eq!(Trigram::from_index(u32::from(t.index())), t);
        }
    }

    #[test]
    fn bits_are_a_bijection() {
        let all: HashSet<u8> = Trigram::ALL.iter().map(|t| t.bits()).collect();
        assert_eq!(all.len(), 8);
    }

    #[test]
    fn zero_remainder_maps_to_kun() {
        assert_eq!(Trigram::from_index(0), Trigram::Kun);
        assert_eq!(Trigram::from_index(16), Trigram::Kun);
        assert_eq!(Trigram::from_index(9), Trigram::Qian);
    }

    #[test]
    fn flipping_twice_restores() {
        for t in Trigram::ALL {
            for line in 1..=3 {
                assert_eq!(t.flip(line).flip(line), t);
                assert_ne!(t.flip(line), t);
            }
        }
    }

    #[test]
    fn flip_third_line_of_qian_gives_dui() {
        assert_eq!(Trigram::Qian.flip(3), Trigram::Dui);
        assert_eq!(Trigram::Kun.flip(1), Trigram::Zhen);
    }

    #[test]
    fn hexagram_table_is_complete_and_unique() {
        let mut names = HashSet::new();
        for upper in Trigram::ALL {
            for lower in Trigram::ALL {
                names.insert(hexagram_name(upper, lower));
            }
        }
        assert_eq!(names.len(), 64);
    }

    #[test]
    fn doubled_trigrams_share_their_name() {
        for t in Trigram::ALL {
            assert_eq!(hexagram_name(t, t), t.name());
        }
    }

    #[test]
    fn well_known_pairs() {
        assert_eq!(hexagram_name(Trigram::Kun, Trigram::Qian), "泰");
        assert_eq!(hexagram_name(Trigram::Qian, Trigram::Kun), "否");
        assert_eq!(hexagram_name(Trigram::Kan, Trigram::Li), "既济");
        assert_eq!(hexagram_name(Trigram::Li, Trigram::Kan), "未济");
    }
}
