//! Procedural quiz generation
//!
//! Every (height, nonce) pair maps to one ordered sequence of questions; the
//! concatenated questions are the prompt the model answers. All nodes must
//! derive identical strings, so the generator is frozen:
//!
//! - PRG: 64-bit LCG, `state = state * 6364136223846793005
//!   + 1442695040888963407` (wrapping). Seeded by reinterpreting the signed
//!   seed as u64. Bounded draws take `(state >> 33) % n` after stepping.
//! - seed0 = height + nonce as wrapping signed 64-bit addition.
//! - question count N = 3 + (first draw mod 3).
//! - question i reseeds with seed0 + i*1000 + (nonce mod 10000).
//!
//! Changing any of these constants is a consensus break.

const LCG_MULTIPLIER: u64 = 6364136223846793005;
const LCG_INCREMENT: u64 = 1442695040888963407;

const FRUITS: [&str; 5] = ["apple", "banana", "cherry", "date", "elderberry"];

/// Frozen linear-congruential generator
pub struct QuizRng {
    state: u64,
}

impl QuizRng {
    pub fn new(seed: i64) -> Self {
        Self { state: seed as u64 }
    }

    fn next_u64(&mut self) -> u64 {
        self.state = self
            .state
            .wrapping_mul(LCG_MULTIPLIER)
            .wrapping_add(LCG_INCREMENT);
        self.state
    }

    /// Draw a value in [0, n). The top bits of the LCG state carry the
    /// best-distributed output.
    fn next_below(&mut self, n: u64) -> u64 {
        (self.next_u64() >> 33) % n
    }
}

/// Generate the deterministic question set for (height, nonce).
pub fn procedural_quiz(height: u64, nonce: u64) -> Vec<String> {
    let seed0 = (height as i64).wrapping_add(nonce as i64);
    let mut rng = QuizRng::new(seed0);

    let count = 3 + rng.next_below(3); // 3..=5 questions
    let mut questions = Vec::with_capacity(count as usize);

    for i in 0..count {
        let question_seed = seed0
            .wrapping_add((i as i64).wrapping_mul(1000))
            .wrapping_add((nonce % 10_000) as i64);
        let mut qrng = QuizRng::new(question_seed);

        let question = match qrng.next_below(4) {
            0 => {
                let x = 1 + qrng.next_below(1000);
                let y = 1 + qrng.next_below(1000);
                format!("What is {x} + {y}?")
            }
            1 => {
                let x = 1 + qrng.next_below(50);
                let y = 1 + qrng.next_below(50);
                format!("What is {x} × {y}?")
            }
            2 => {
                let start = 1 + qrng.next_below(10);
                let step = 1 + qrng.next_below(5);
                format!(
                    "Complete the pattern: {}, {}, {}, ?",
                    start,
                    start + step,
                    start + 2 * step
                )
            }
            _ => {
                let idx = qrng.next_below(FRUITS.len() as u64) as usize;
                format!("What fruit comes after {} in alphabetical order?", FRUITS[idx])
            }
        };
        questions.push(question);
    }

    questions
}

/// Canonical prompt for a question set. Shared by the miner and the
/// validator: replay must be bit-identical, so this is the only place the
/// prompt string is assembled.
pub fn build_prompt(questions: &[String]) -> String {
    let mut prompt = String::from("Please answer these questions:\n");
    for q in questions {
        prompt.push_str(q);
        prompt.push('\n');
    }
    prompt.push_str("Answers:\n");
    prompt
}

/// Prompt for (height, nonce) in one step
pub fn quiz_prompt(height: u64, nonce: u64) -> String {
    build_prompt(&procedural_quiz(height, nonce))
}
