use rand::Rng;

/// Source of election ranks. Every rank drawn must be positive, since 0 means "unranked".
pub trait RankSource: Send {
    fn next_rank(&mut self) -> i32;
}

impl<R: RankSource + ?Sized> RankSource for Box<R> {
    fn next_rank(&mut self) -> i32 {
        (**self).next_rank()
    }
}

/// Uniform ranks in `1..i32::MAX`.
#[derive(Clone, Copy, Debug, Default)]
pub struct RandomRanks;

impl RankSource for RandomRanks {
    fn next_rank(&mut self) -> i32 {
        rand::thread_rng().gen_range(1..i32::MAX)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_ranks_are_positive() {
        let mut ranks = RandomRanks;
        for _ in 0..1000 {
            assert!(ranks.next_rank() > 0);
        }
    }
}
