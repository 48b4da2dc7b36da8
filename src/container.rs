//! Hierarchical scopes owning lazily created singletons.

use std::any::{Any, TypeId, type_name};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::{self, FutureExt, LocalBoxFuture};

use crate::disposable::{AsyncDispose, DisposeResult, dispose_all};
use crate::error::ContainerError;

/// An object that knows how to create instances for a token.
pub trait InstanceFactory<T> {
    fn create_instance(&self, container: &Container) -> T;
}

/// A type that can construct itself from a container.
pub trait FromContainer: Sized + 'static {
    fn from_container(container: &Container) -> Self;
}

enum Recipe<T> {
    Factory(Rc<dyn InstanceFactory<T>>),
    Function(Rc<dyn Fn(&Container) -> T>),
    Class(fn(&Container) -> T),
    Opaque,
}

impl<T> Clone for Recipe<T> {
    fn clone(&self) -> Self {
        match self {
            Recipe::Factory(factory) => Recipe::Factory(factory.clone()),
            Recipe::Function(function) => Recipe::Function(function.clone()),
            Recipe::Class(class) => Recipe::Class(*class),
            Recipe::Opaque => Recipe::Opaque,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TokenKey {
    Type(TypeId),
    Unique(u64),
}

impl TokenKey {
    fn unique() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        TokenKey::Unique(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

type DisposeFn<T> = fn(&T) -> LocalBoxFuture<'static, DisposeResult>;
type EntryDispose = Box<dyn Fn() -> LocalBoxFuture<'static, DisposeResult>>;

/// Identifies an entry in a [`Container`] and says how to create it.
///
/// The creation protocol is fixed when the token is built. Tokens made with
/// [`Token::class`] are keyed by type, every other token is unique and only
/// its clones refer to the same entry.
pub struct Token<T: 'static> {
    key: TokenKey,
    name: &'static str,
    recipe: Recipe<T>,
    dispose: Option<DisposeFn<T>>,
}

impl<T: 'static> Token<T> {
    /// A token whose instances are created by a factory object.
    pub fn factory(factory: impl InstanceFactory<T> + 'static) -> Self {
        Self::unique(Recipe::Factory(Rc::new(factory)))
    }

    /// A token whose instances are created by a function.
    pub fn function(function: impl Fn(&Container) -> T + 'static) -> Self {
        Self::unique(Recipe::Function(Rc::new(function)))
    }

    /// A token that can be [`set`](Container::set) but never created.
    pub fn opaque() -> Self {
        Self::unique(Recipe::Opaque)
    }

    /// The token of a type that constructs itself.
    pub fn class() -> Self
    where
        T: FromContainer,
    {
        Self {
            key: TokenKey::Type(TypeId::of::<T>()),
            name: type_name::<T>(),
            recipe: Recipe::Class(T::from_container),
            dispose: None,
        }
    }

    /// Disposes instances of this token when they leave the container.
    pub fn disposable(mut self) -> Self
    where
        T: AsyncDispose,
    {
        self.dispose = Some(|instance: &T| instance.dispose());
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn unique(recipe: Recipe<T>) -> Self {
        Self {
            key: TokenKey::unique(),
            name: type_name::<T>(),
            recipe,
            dispose: None,
        }
    }
}

impl<T: 'static> Clone for Token<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key,
            name: self.name,
            recipe: self.recipe.clone(),
            dispose: self.dispose,
        }
    }
}

impl<T: 'static> std::fmt::Debug for Token<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Token")
            .field("key", &self.key)
            .field("name", &self.name)
            .finish()
    }
}

struct Entry {
    instance: Rc<dyn Any>,
    dispose: Option<EntryDispose>,
}

impl Entry {
    fn new<T: 'static>(instance: Rc<T>, dispose: Option<DisposeFn<T>>) -> Self {
        let dispose = dispose.map(|dispose| {
            let instance = instance.clone();
            Box::new(move || dispose(&instance)) as EntryDispose
        });

        Self { instance, dispose }
    }

    fn dispose(self) -> LocalBoxFuture<'static, DisposeResult> {
        match self.dispose {
            Some(dispose) => dispose(),
            None => future::ready(Ok(())).boxed_local(),
        }
    }
}

struct Scope {
    parent: Option<Container>,
    entries: RefCell<HashMap<TokenKey, Entry>>,
    /// Disposals of instances displaced by `set`, awaited by `dispose`.
    displaced: RefCell<Vec<LocalBoxFuture<'static, DisposeResult>>>,
}

/// A scope of singleton instances.
///
/// Reads walk up the chain of parents, writes only ever touch the local
/// scope. Cloning yields another handle to the same scope.
///
/// ```rust
/// use reactask::{Container, Token};
///
/// let counter = Token::function(|_| vec![1, 2, 3]);
///
/// let root = Container::new();
/// let child = root.child();
///
/// let shared = root.get(&counter)?;
/// assert!(std::rc::Rc::ptr_eq(&shared, &child.get(&counter)?));
///
/// let own = child.get_own(&counter)?;
/// assert!(!std::rc::Rc::ptr_eq(&shared, &own));
/// # Ok::<_, reactask::ContainerError>(())
/// ```
#[derive(Clone)]
pub struct Container {
    scope: Rc<Scope>,
}

impl Container {
    pub fn new() -> Self {
        Self::with_parent(None)
    }

    fn with_parent(parent: Option<Container>) -> Self {
        Self {
            scope: Rc::new(Scope {
                parent,
                entries: RefCell::new(HashMap::new()),
                displaced: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Creates a nested scope.
    pub fn child(&self) -> Container {
        Self::with_parent(Some(self.clone()))
    }

    pub fn parent(&self) -> Option<&Container> {
        self.scope.parent.as_ref()
    }

    /// Returns the instance held by this scope or the nearest ancestor,
    /// creating one in this scope when none exists.
    pub fn get<T: 'static>(&self, token: &Token<T>) -> Result<Rc<T>, ContainerError> {
        match self.find(token)? {
            Some(instance) => Ok(instance),
            None => self.create(token),
        }
    }

    /// Returns the instance held by this scope, creating one when none
    /// exists. Ancestors are ignored.
    pub fn get_own<T: 'static>(&self, token: &Token<T>) -> Result<Rc<T>, ContainerError> {
        match self.find_own(token)? {
            Some(instance) => Ok(instance),
            None => self.create(token),
        }
    }

    pub fn has<T: 'static>(&self, token: &Token<T>) -> bool {
        self.has_own(token) || self.parent().is_some_and(|parent| parent.has(token))
    }

    pub fn has_own<T: 'static>(&self, token: &Token<T>) -> bool {
        self.scope.entries.borrow().contains_key(&token.key)
    }

    /// Stores an instance in this scope, replacing any previous one.
    ///
    /// The disposal of a replaced instance starts right away and is awaited
    /// by the next [`dispose`](Self::dispose) of this scope.
    pub fn set<T: 'static>(&self, token: &Token<T>, value: T) -> Rc<T> {
        let instance = Rc::new(value);
        self.insert(token, instance.clone());
        instance
    }

    /// Removes the local instance and disposes it if the token is
    /// disposable.
    pub fn delete<T: 'static>(&self, token: &Token<T>) -> LocalBoxFuture<'static, DisposeResult> {
        let entry = self.scope.entries.borrow_mut().remove(&token.key);

        match entry {
            Some(entry) => entry.dispose(),
            None => future::ready(Ok(())).boxed_local(),
        }
    }

    /// Removes every local instance and disposes them concurrently.
    ///
    /// Resolves once all disposals finished, with the first failure if any.
    pub fn dispose(&self) -> LocalBoxFuture<'static, DisposeResult> {
        let entries = std::mem::take(&mut *self.scope.entries.borrow_mut());
        let mut disposals = std::mem::take(&mut *self.scope.displaced.borrow_mut());
        tracing::debug!(instances = entries.len(), displaced = disposals.len(), "disposing container");

        disposals.extend(entries.into_values().map(Entry::dispose));
        dispose_all(disposals)
    }

    pub fn len(&self) -> usize {
        self.scope.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.scope.entries.borrow().is_empty()
    }

    fn find<T: 'static>(&self, token: &Token<T>) -> Result<Option<Rc<T>>, ContainerError> {
        if let Some(instance) = self.find_own(token)? {
            return Ok(Some(instance));
        }

        match self.parent() {
            Some(parent) => parent.find(token),
            None => Ok(None),
        }
    }

    fn find_own<T: 'static>(&self, token: &Token<T>) -> Result<Option<Rc<T>>, ContainerError> {
        let instance = match self.scope.entries.borrow().get(&token.key) {
            Some(entry) => entry.instance.clone(),
            None => return Ok(None),
        };

        instance
            .downcast::<T>()
            .map(Some)
            .map_err(|_| ContainerError::TypeMismatch(token.name))
    }

    fn create<T: 'static>(&self, token: &Token<T>) -> Result<Rc<T>, ContainerError> {
        tracing::debug!(token = token.name, "creating instance");

        // No borrow is held here, the recipe may use the container.
        let value = match &token.recipe {
            Recipe::Factory(factory) => factory.create_instance(self),
            Recipe::Function(function) => function(self),
            Recipe::Class(class) => class(self),
            Recipe::Opaque => return Err(ContainerError::NotInstantiable(token.name)),
        };

        let instance = Rc::new(value);
        self.insert(token, instance.clone());
        Ok(instance)
    }

    fn insert<T: 'static>(&self, token: &Token<T>, instance: Rc<T>) {
        let displaced = self
            .scope
            .entries
            .borrow_mut()
            .insert(token.key, Entry::new(instance, token.dispose));

        if let Some(entry) = displaced {
            tracing::debug!(token = token.name, "replacing instance");
            let disposal = entry.dispose();
            self.scope.displaced.borrow_mut().push(disposal);
        }
    }
}

impl Default for Container {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncDispose for Container {
    fn dispose(&self) -> LocalBoxFuture<'static, DisposeResult> {
        Container::dispose(self)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::disposable::Disposable;

    struct Greeting(String);

    impl FromContainer for Greeting {
        fn from_container(container: &Container) -> Self {
            let name = container.get(&name_token()).unwrap();
            Greeting(format!("hello {name}"))
        }
    }

    thread_local! {
        static NAME: Token<&'static str> = Token::function(|_| "world");
    }

    fn name_token() -> Token<&'static str> {
        NAME.with(Token::clone)
    }

    struct Doubler(u32);

    impl InstanceFactory<u32> for Doubler {
        fn create_instance(&self, _: &Container) -> u32 {
            self.0 * 2
        }
    }

    #[test]
    fn test_creation_protocols() {
        let container = Container::new();

        let greeting = container.get(&Token::<Greeting>::class()).unwrap();
        assert_eq!(greeting.0, "hello world");
        assert!(container.has_own(&name_token()));

        let doubled = container.get(&Token::factory(Doubler(21))).unwrap();
        assert_eq!(*doubled, 42);
    }

    #[test]
    fn test_singleton_per_scope() {
        let container = Container::new();
        let token = Token::function(|_| String::from("foo"));

        let a = container.get(&token).unwrap();
        let b = container.get(&token.clone()).unwrap();
        assert!(Rc::ptr_eq(&a, &b));

        // a different token is a different entry
        let other = container.get(&Token::function(|_| String::from("foo"))).unwrap();
        assert!(!Rc::ptr_eq(&a, &other));

        // class tokens are keyed by type
        let x = container.get(&Token::<Greeting>::class()).unwrap();
        let y = container.get(&Token::<Greeting>::class()).unwrap();
        assert!(Rc::ptr_eq(&x, &y));
    }

    #[test]
    fn test_child_scoping() {
        let parent = Container::new();
        let child = parent.child();
        let token = Token::function(|_| Cell::new(0));

        let shared = parent.get(&token).unwrap();
        assert!(Rc::ptr_eq(&shared, &child.get(&token).unwrap()));
        assert!(child.has(&token));
        assert!(!child.has_own(&token));

        let own = child.get_own(&token).unwrap();
        assert!(!Rc::ptr_eq(&shared, &own));
        assert!(Rc::ptr_eq(&own, &child.get(&token).unwrap()));
        assert!(Rc::ptr_eq(&own, &child.get_own(&token).unwrap()));

        own.set(1);
        assert_eq!(shared.get(), 0);
        assert!(Rc::ptr_eq(&shared, &parent.get(&token).unwrap()));
    }

    #[test]
    fn test_child_creates_locally() {
        let parent = Container::new();
        let child = parent.child();
        let token = Token::function(|_| 7);

        child.get(&token).unwrap();
        assert!(child.has_own(&token));
        assert!(!parent.has(&token));
        assert!(child.parent().is_some());
    }

    #[test]
    fn test_opaque_token() {
        let container = Container::new();
        let token = Token::<u32>::opaque();

        let err = container.get(&token).unwrap_err();
        assert!(matches!(err, ContainerError::NotInstantiable(_)));

        container.set(&token, 5);
        assert_eq!(*container.get(&token).unwrap(), 5);

        // last writer wins
        container.set(&token, 6);
        assert_eq!(*container.get(&token).unwrap(), 6);
    }

    fn disposable_token(count: Rc<Cell<u32>>) -> Token<Disposable> {
        Token::function(move |_| {
            let count = count.clone();
            Disposable::from_fn(move || {
                count.set(count.get() + 1);
                Ok(())
            })
        })
        .disposable()
    }

    #[tokio::test]
    async fn test_delete_disposes_local_instance() {
        let count = Rc::new(Cell::new(0));
        let token = disposable_token(count.clone());

        let parent = Container::new();
        let child = parent.child();
        parent.get(&token).unwrap();

        child.delete(&token).await.unwrap();
        assert_eq!(count.get(), 0);
        assert!(parent.has_own(&token));

        parent.delete(&token).await.unwrap();
        assert_eq!(count.get(), 1);
        assert!(!parent.has(&token));
    }

    #[tokio::test]
    async fn test_dispose_all_instances() {
        let count = Rc::new(Cell::new(0));
        let container = Container::new();

        container.get(&disposable_token(count.clone())).unwrap();
        container.get(&disposable_token(count.clone())).unwrap();
        container.get(&Token::function(|_| "plain")).unwrap();
        assert_eq!(container.len(), 3);

        container.dispose().await.unwrap();
        assert_eq!(count.get(), 2);
        assert!(container.is_empty());

        container.dispose().await.unwrap();
        assert_eq!(count.get(), 2);
    }

    #[tokio::test]
    async fn test_set_disposes_replaced_instance() {
        let counting = |count: &Rc<Cell<u32>>| {
            let count = count.clone();
            Disposable::from_fn(move || {
                count.set(count.get() + 1);
                Ok(())
            })
        };
        let first = Rc::new(Cell::new(0));
        let second = Rc::new(Cell::new(0));

        let container = Container::new();
        let token = Token::<Disposable>::opaque().disposable();

        container.set(&token, counting(&first));
        container.set(&token, counting(&second));
        assert_eq!(container.len(), 1);

        container.dispose().await.unwrap();
        assert_eq!(first.get(), 1);
        assert_eq!(second.get(), 1);
    }

    #[tokio::test]
    async fn test_dispose_reports_failure() {
        let container = Container::new();
        let failing = Token::function(|_| Disposable::from_fn(|| Err(anyhow::anyhow!("foo"))))
            .disposable();

        container.get(&failing).unwrap();
        let err = container.dispose().await.unwrap_err();
        assert_eq!(err.to_string(), "foo");
    }
}
