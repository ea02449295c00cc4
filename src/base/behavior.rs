// Behaviors shared by every clocked component of the hierarchy.
pub trait ModuleBehaviors {
    // Advance the component by exactly one clock.
    fn tick_one(&mut self);

    // Clear accumulated statistics without touching architectural state.
    fn reset(&mut self);

    fn tick(&mut self, cycles: u64) {
        for _ in 0..cycles {
            self.tick_one();
        }
    }
}
