use xtra::Actor;

pub trait ActorName {
    fn name() -> String;
}

impl<T> ActorName for T
where
    T: Actor,
{
    /// Devise the name of an actor from its type on a best-effort
    /// basis.
    fn name() -> String {
        std::any::type_name::<T>().to_string()
    }
}
